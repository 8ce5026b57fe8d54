//! httptap - passive HTTP/1.x traffic tap
//!
//! Reassembles captured TCP traffic into byte streams, parses requests and
//! responses off each direction, pairs them up per connection and hands
//! every event to a storage collaborator.

pub mod assembly;
pub mod capture;
pub mod config;
pub mod driver;
pub mod http;
pub mod launch;
pub mod report;
pub mod storage;
pub mod tracker;
