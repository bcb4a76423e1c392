pub mod job;
pub mod poller;
pub mod status;
pub mod worker;
