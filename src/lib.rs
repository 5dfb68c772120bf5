pub mod backend;
pub mod config;
pub mod control;
pub mod midi;
pub mod music;
pub mod seq;
pub mod source;
pub mod tui;
pub mod velocity;
