pub mod dispatch;
pub mod router;
pub mod watchdog;
pub mod worker;
