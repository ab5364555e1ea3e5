pub mod actioncache;
pub mod channel;
pub mod executionservice;
pub mod proto;
