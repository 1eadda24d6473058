//! One real kernel thread per guest thread, whose only job is to block in
//! `syscall()` so the scheduler's single dispatch thread never has to.
//! Results come back over a channel the scheduler polls alongside its own
//! idle loop; there is deliberately no async runtime here, since a proxy
//! spends its whole life inside one blocking call at a time.

use dynamo_types::ThreadId;
use std::sync::mpsc;
use std::thread::JoinHandle;

/// Arguments exactly as they sit in EBX/ECX/EDX/ESI/EDI/EBP at the moment
/// of `int $0x80`.
#[derive(Debug, Clone, Copy)]
pub struct SyscallArgs {
    pub nr: i64,
    pub args: [i64; 6],
}

#[derive(Debug, Clone, Copy)]
pub struct SyscallResult {
    pub tid: ThreadId,
    pub retval: i64,
}

enum ProxyMsg {
    Run(SyscallArgs),
    Abort,
}

/// A leased real kernel thread parked waiting for its guest thread's next
/// blocking syscall.
pub struct ProxyLwp {
    tid: ThreadId,
    to_proxy: mpsc::Sender<ProxyMsg>,
    handle: Option<JoinHandle<()>>,
}

impl ProxyLwp {
    /// Spawns the kernel thread; `results` is the single fd-equivalent the
    /// scheduler polls for every proxy's completions.
    pub fn spawn(tid: ThreadId, results: mpsc::Sender<SyscallResult>) -> Self {
        let (to_proxy, from_sched) = mpsc::channel::<ProxyMsg>();
        let handle = std::thread::Builder::new()
            .name(format!("proxy-{tid}"))
            .spawn(move || proxy_loop(tid, from_sched, results))
            .expect("spawning a proxy LWP");
        ProxyLwp { tid, to_proxy, handle: Some(handle) }
    }

    /// Hands a blocking syscall to this proxy. The caller moves the guest
    /// thread to `WaitSys` before calling this; the result arrives later on
    /// the shared `results` channel, not as this call's return value.
    pub fn run(&self, args: SyscallArgs) {
        let _ = self.to_proxy.send(ProxyMsg::Run(args));
    }

    /// Interrupts an in-flight blocking syscall by sending the proxy thread
    /// a signal, the same primitive the host kernel uses to produce EINTR
    /// for any interruptible syscall.
    pub fn abort(&self) {
        let _ = self.to_proxy.send(ProxyMsg::Abort);
        if let Some(handle) = &self.handle {
            let native = native_handle(handle);
            unsafe {
                libc::pthread_kill(native, libc::SIGUSR1);
            }
        }
    }

    pub fn tid(&self) -> ThreadId {
        self.tid
    }
}

impl Drop for ProxyLwp {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            // The channel closing when `to_proxy` drops unblocks the loop
            // between syscalls; an in-flight syscall still has to return on
            // its own, same as a real kernel thread exiting underneath one.
            let _ = handle.join();
        }
    }
}

fn native_handle(handle: &JoinHandle<()>) -> libc::pthread_t {
    use std::os::unix::thread::JoinHandleExt;
    handle.as_pthread_t()
}

fn proxy_loop(tid: ThreadId, from_sched: mpsc::Receiver<ProxyMsg>, results: mpsc::Sender<SyscallResult>) {
    install_noop_sigusr1_handler();
    while let Ok(msg) = from_sched.recv() {
        match msg {
            ProxyMsg::Run(call) => {
                let retval = issue(call);
                if results.send(SyscallResult { tid, retval }).is_err() {
                    return;
                }
            }
            ProxyMsg::Abort => {}
        }
    }
}

/// `SIGUSR1` needs a handler installed (not the default, which terminates
/// the process) purely so `pthread_kill` can interrupt a blocking syscall
/// with EINTR without taking the proxy thread down.
fn install_noop_sigusr1_handler() {
    unsafe {
        libc::signal(libc::SIGUSR1, handle_sigusr1 as libc::sighandler_t);
    }
}

extern "C" fn handle_sigusr1(_: libc::c_int) {}

fn issue(call: SyscallArgs) -> i64 {
    unsafe {
        libc::syscall(
            call.nr as libc::c_long,
            call.args[0],
            call.args[1],
            call.args[2],
            call.args[3],
            call.args[4],
            call.args[5],
        ) as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn a_non_blocking_syscall_round_trips_through_a_proxy() {
        let (tx, rx) = mpsc::channel();
        let proxy = ProxyLwp::spawn(ThreadId::new(1), tx);
        // SYS_getpid takes no pointer-shaped args and never blocks.
        proxy.run(SyscallArgs { nr: libc::SYS_getpid, args: [0; 6] });
        let result = rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap();
        assert_eq!(result.tid, ThreadId::new(1));
        assert!(result.retval > 0);
    }
}
