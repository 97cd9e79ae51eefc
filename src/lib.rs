pub mod auth;
pub mod calendar;
pub mod clock;
pub mod engine;
pub mod limits;
pub mod model;
pub mod observability;
pub mod reaper;
pub mod roles;
pub mod sql;
pub mod tls;
pub mod wal;
pub mod wire;
