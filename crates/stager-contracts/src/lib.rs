pub mod canvas;
pub mod events;
pub mod runs;
pub mod stages;
