pub mod constants;
pub mod geometry;
pub mod input_buffer;
pub mod simulation;
pub mod spatial;
pub mod state;
pub mod systems;
pub mod validation;
