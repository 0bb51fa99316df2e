/// Blocks and their trackside descriptors.
pub mod components;
/// Built-in Green and Red line layouts.
pub mod layout;
/// The static per-line block graph.
pub mod track;
