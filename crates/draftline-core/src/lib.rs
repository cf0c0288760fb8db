// Library root for the draft synchronization engine: the pure, I/O-free
// parts shared by every transport and front end.

pub mod draft;
pub mod protocol;
pub mod reconnect;
pub mod sync;
