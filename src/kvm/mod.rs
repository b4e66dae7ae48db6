pub mod discovery;
pub mod ioctls;
pub mod memslots;
pub mod tracee;
