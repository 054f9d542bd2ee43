pub mod activities;
pub mod backup;
pub mod classes;
pub mod core;
pub mod curriculum;
pub mod materials;
pub mod progress;
pub mod users;
