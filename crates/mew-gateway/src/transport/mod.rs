pub mod fifo;
pub mod websocket;
