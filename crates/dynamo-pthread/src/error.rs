//! Every pthread-engine failure maps to a POSIX errno returned to the guest
//! (per the propagation policy: the engine never panics on guest misuse).

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PthreadError {
    #[error("thread attempted to join itself")]
    SelfJoin,
    #[error("joinee thread is detached")]
    JoinOfDetached,
    #[error("joinee already has a joiner")]
    SecondJoiner,
    #[error("unlock attempted by a thread that does not own the mutex")]
    UnlockNotOwned,
    #[error("mutex already locked and not recursive")]
    MutexBusy,
    #[error("thread-specific key table is full")]
    KeyTableFull,
    #[error("operation referenced an unknown or unused key")]
    UnknownKey,
    #[error("target thread id is out of range or not live")]
    NoSuchThread,
}

impl PthreadError {
    /// The guest-visible errno this condition maps to.
    pub fn errno(&self) -> dynamo_types::Errno {
        match self {
            PthreadError::SelfJoin => libc::EDEADLK,
            PthreadError::JoinOfDetached => libc::EINVAL,
            PthreadError::SecondJoiner => libc::EINVAL,
            PthreadError::UnlockNotOwned => libc::EPERM,
            PthreadError::MutexBusy => libc::EBUSY,
            PthreadError::KeyTableFull => libc::EAGAIN,
            PthreadError::UnknownKey => libc::EINVAL,
            PthreadError::NoSuchThread => libc::ESRCH,
        }
    }
}
