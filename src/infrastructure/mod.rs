pub mod sim_gateway;
