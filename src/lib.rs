pub mod rtc;
pub mod serve;
pub mod signal;
pub mod transport;
