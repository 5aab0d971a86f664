pub mod anthropic_proxy;
pub mod app;
pub mod apps;
pub mod auth;
pub mod bus;
pub mod config;
pub mod context;
pub mod disambiguator;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod handlers;
pub mod providers;
pub mod recorder;
pub mod relay;
pub mod resolver;
pub mod session_handlers;
pub mod sessions;
pub mod store;
pub mod upstream;
pub mod users;
