pub mod broker_gateway;
pub mod store;
