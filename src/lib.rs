pub mod activation;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod protocol;
pub mod schedule;
pub mod platform {
    pub mod foreground;
    pub mod screen;
}
pub mod processing {
    pub mod color;
    pub mod resize;
}
pub mod tasks {
    pub mod control;
    pub mod runtime;
    pub mod status;
}
