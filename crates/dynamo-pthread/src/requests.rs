//! Client-request codes the pthread engine answers. Core requests occupy
//! `0x1001`..`0x13ff`; a per-plugin 16-bit subspace above that is selected by
//! the top two bytes and is not this crate's concern.

pub type RequestCode = u32;

pub const MUTEX_LOCK: RequestCode = 0x1001;
pub const MUTEX_UNLOCK: RequestCode = 0x1002;
pub const MUTEX_TRYLOCK: RequestCode = 0x1003;
pub const COND_WAIT: RequestCode = 0x1010;
pub const COND_SIGNAL: RequestCode = 0x1011;
pub const COND_BROADCAST: RequestCode = 0x1012;
pub const JOIN: RequestCode = 0x1020;
pub const QUIT: RequestCode = 0x1021;
pub const WAIT_JOINER: RequestCode = 0x1022;
pub const CANCEL: RequestCode = 0x1030;
pub const SET_CANCEL_STATE: RequestCode = 0x1031;
pub const TESTCANCEL: RequestCode = 0x1032;
pub const KEY_CREATE: RequestCode = 0x1040;
pub const KEY_DELETE: RequestCode = 0x1041;
pub const KEY_GETSPECIFIC_PTR: RequestCode = 0x1042;
pub const KEY_SETSPECIFIC_PTR: RequestCode = 0x1043;
pub const SIGMASK: RequestCode = 0x1050;
pub const KILL: RequestCode = 0x1051;
/// Guest wrote self-modifying code: discard every cached translation
/// overlapping `[args[0], args[0]+args[1])`. Not a pthread operation; routed
/// straight to the trace cache by the caller rather than through
/// [`crate::dispatch::PthreadEngine::dispatch`], but shares this crate's
/// request-code namespace since it rides the same client-request packet.
pub const DISCARD_TRANSLATIONS: RequestCode = 0x1060;

/// Request code plus its fixed 4-word argument packet, already read out of
/// the guest's client-request structure by the caller (`dynamo-machine` on
/// a real host; a test harness directly). This crate never touches guest
/// memory to find the packet itself — only individual args that are
/// themselves guest pointers (a mutex, a condvar) get dereferenced, via
/// [`dynamo_cpu_core::GuestBus`].
#[derive(Debug, Clone, Copy)]
pub struct ClientRequest {
    pub code: RequestCode,
    pub args: [u32; 4],
}
