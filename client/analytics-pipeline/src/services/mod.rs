pub mod attribution;
pub mod consent;
pub mod context;
pub mod cost_control;
pub mod destination;
pub mod dispatcher;
pub mod export;
pub mod identity;
