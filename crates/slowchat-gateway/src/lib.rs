pub mod connection;
pub mod delivery;
pub mod dispatcher;
pub mod identity;
pub mod typing;
