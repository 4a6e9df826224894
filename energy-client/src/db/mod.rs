pub mod bill_queries;
pub mod device_queries;
pub mod ota_queries;
pub mod reset_queries;
