pub mod acquire;
pub mod commands;
pub mod connection;
pub mod decode;
pub mod modbus;
pub mod mqtt;
pub mod output;
pub mod registers;
pub mod snapshot;
