//! Extraction of instruction starts from GNU `objdump -d` listings.
//!
//! Instruction lines look like `  401000:\tf3 0f 1e fa          \tendbr64`. Long encodings
//! wrap onto continuation lines that repeat the address column but only carry bytes, which
//! means they have a single tab. Addresses objdump cannot decode are printed as `(bad)`.

use std::collections::BTreeSet;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Listing {
    pub offsets: BTreeSet<i64>,
    pub undecoded: usize,
}

enum Line {
    Instruction(i64),
    Undecoded,
    Other,
}

fn parse_line(line: &str) -> Line {
    let Some((address, rest)) = line.trim_start().split_once(':') else {
        return Line::Other;
    };
    if address.is_empty() || !address.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Line::Other;
    }
    let Ok(address) = i64::from_str_radix(address, 16) else {
        return Line::Other;
    };

    let mut columns = rest.split('\t').skip(1);
    let (Some(_bytes), Some(mnemonic)) = (columns.next(), columns.next()) else {
        // Continuation of the previous instruction's bytes
        return Line::Other;
    };

    // Unlike a plain two-column count, undecodable addresses are not claimed as instruction
    // starts; they only add to `Listing::undecoded`.
    if mnemonic.trim_start().starts_with("(bad)") {
        Line::Undecoded
    } else {
        Line::Instruction(address)
    }
}

pub fn parse_listing(text: &str) -> Listing {
    let mut listing = Listing::default();
    for line in text.lines() {
        match parse_line(line) {
            Line::Instruction(address) => {
                listing.offsets.insert(address);
            }
            Line::Undecoded => listing.undecoded += 1,
            Line::Other => {}
        }
    }
    listing
}
