pub mod health;
pub mod longpoll;
