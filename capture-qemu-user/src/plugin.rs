use std::os::raw::c_char;

use groundtruth::session::{CaptureConfig, CaptureSession};
use groundtruth::{Hex, InstructionOffset};

use crate::{capture, qemu};

pub fn on_plugin_install(id: qemu::qemu_plugin_id_t, info: &qemu::qemu_info_t, args: Args) {
    let _span = tracing::trace_span!("on_plugin_install", id = id).entered();

    if info.system_emulation {
        tracing::error!("instruction capture only supports user-mode emulation");
        panic!()
    }

    let config = match CaptureConfig::from_args(args) {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(error = %err, "invalid plugin arguments");
            panic!()
        }
    };

    tracing::info! {
        arch = info.target_name().unwrap_or("unknown"),
        binary = %config.binary.display(),
        output = %config.output.display(),
        "capturing executed instructions"
    };

    capture::initialize(CaptureSession::new(config));

    register_vcpu_init::<Plugin>(id);
    register_on_tb_trans::<Plugin>(id);
    register_on_exit(Plugin, id);
}

pub struct Scope;

pub struct Args<'scope> {
    _scope: &'scope Scope,
    argc: usize,
    argv: *const *const c_char,
    curr: usize,
}

impl<'scope> Args<'scope> {
    pub fn new(s: &'scope Scope, argc: i32, argv: *const *const c_char) -> Self {
        if argc < 0 {
            tracing::error!(argc = argc, "unexpected value for argc");
            panic!()
        }

        if argc > 0 && argv.is_null() {
            tracing::error!(argv = ?argv, "unexpected value for argv");
            panic!()
        }

        Self {
            _scope: s,
            argc: argc as usize,
            argv,
            curr: 0,
        }
    }
}

impl<'scope> Iterator for Args<'scope> {
    type Item = &'scope str;

    fn next(&mut self) -> Option<Self::Item> {
        while self.curr < self.argc {
            let i = self.curr;
            self.curr += 1;

            let argv_n = unsafe { self.argv.add(i).read() };
            if argv_n.is_null() {
                tracing::warn!(n = i, "skipping null argument");
                continue;
            }

            let c_str = unsafe { std::ffi::CStr::from_ptr(argv_n) };

            let Ok(arg) = c_str.to_str() else {
                tracing::warn!(n = i, arg = ?c_str, "skipping argument with non-UTF-8 data");
                continue;
            };

            return Some(arg);
        }
        None
    }
}

pub struct Plugin;

pub trait OnVCpuInit {
    fn on_vcpu_init(id: qemu::qemu_plugin_id_t, vcpu_index: u32);
}

impl OnVCpuInit for Plugin {
    fn on_vcpu_init(id: qemu::qemu_plugin_id_t, vcpu_index: u32) {
        let _span = tracing::trace_span!("on_vcpu_init", id = id, vcpu = vcpu_index).entered();

        // Grow the worker table here rather than on the first executed instruction.
        capture::session().worker(vcpu_index as usize);

        let thread_id = unsafe { libc::gettid() };
        tracing::debug!(vcpu = vcpu_index, tid = thread_id, "vcpu started");
    }
}

pub trait OnExit {
    fn on_exit(&self, id: qemu::qemu_plugin_id_t);
}

impl OnExit for Plugin {
    fn on_exit(&self, id: qemu::qemu_plugin_id_t) {
        let _span = tracing::trace_span!("on_exit", id = id).entered();

        if let Err(err) = capture::session().finish() {
            tracing::error!(error = %err, "failed to write capture");
            let mut source = std::error::Error::source(&err);
            while let Some(cause) = source {
                tracing::error!(cause = %cause);
                source = std::error::Error::source(cause);
            }
            panic!()
        }
    }
}

pub trait OnTbTrans {
    fn on_tb_trans(id: qemu::qemu_plugin_id_t, tb: *mut qemu::qemu_plugin_tb);
}

impl OnTbTrans for Plugin {
    fn on_tb_trans(id: qemu::qemu_plugin_id_t, tb: *mut qemu::qemu_plugin_tb) {
        let _span = tracing::trace_span! {
            "on_tb_trans",
            id = id,
            address = %Hex(unsafe { qemu::qemu_plugin_tb_vaddr(tb) })
        }
        .entered();

        let session = capture::session();
        let count = unsafe { qemu::qemu_plugin_tb_n_insns(tb) };

        for i in 0..count {
            let insn = unsafe { qemu::qemu_plugin_tb_get_insn(tb, i) };
            let vaddr = unsafe { qemu::qemu_plugin_insn_vaddr(insn) };
            let size = unsafe { qemu::qemu_plugin_insn_size(insn) };

            let token = match session.translate(vaddr, size) {
                Ok(Some(token)) => token,
                Ok(None) => continue,
                Err(err) => {
                    tracing::error!(error = %err, "unable to resolve instruction address");
                    panic!()
                }
            };

            tracing::trace! {
                vaddr = %Hex(vaddr),
                offset = %Hex(token.offset),
                length = token.length,
                "registering instruction callback"
            };

            register_on_insn_exec(token, insn, qemu::QEMU_PLUGIN_CB_NO_REGS);
        }
    }
}

pub trait OnInsnExec {
    fn on_insn_exec(&self, vcpu_index: u32);
}

impl OnInsnExec for InstructionOffset {
    #[inline]
    fn on_insn_exec(&self, vcpu_index: u32) {
        capture::with_worker(vcpu_index, |worker| worker.insert(*self));
    }
}

pub fn register_vcpu_init<T: OnVCpuInit>(id: qemu::qemu_plugin_id_t) {
    unsafe {
        qemu::qemu_plugin_register_vcpu_init_cb(id, qemu::vcpu_init_wrapper::<T>);
    }
}

pub fn register_on_exit<T: OnExit>(t: T, id: qemu::qemu_plugin_id_t) {
    let userdata: *mut T = Box::leak(Box::new(t)) as _;
    unsafe {
        qemu::qemu_plugin_register_atexit_cb(id, qemu::atexit_wrapper::<T>, userdata.cast());
    }
}

pub fn register_on_tb_trans<T: OnTbTrans>(id: qemu::qemu_plugin_id_t) {
    unsafe {
        qemu::qemu_plugin_register_vcpu_tb_trans_cb(id, qemu::vcpu_tb_trans_wrapper::<T>);
    }
}

/// Registers `t` as the token passed back on every execution of `insn`.
///
/// Tokens are leaked: QEMU may run the translated block until the process exits.
pub fn register_on_insn_exec<T: OnInsnExec>(t: T, insn: *mut qemu::qemu_plugin_insn, flags: i32) {
    let userdata: *mut T = Box::leak(Box::new(t)) as _;
    unsafe {
        qemu::qemu_plugin_register_vcpu_insn_exec_cb(
            insn,
            qemu::vcpu_insn_exec_wrapper::<T>,
            flags,
            userdata as _,
        );
    }
}
