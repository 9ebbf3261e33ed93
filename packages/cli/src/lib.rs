// ABOUTME: Library half of the sandloop command-line launcher
// ABOUTME: Exposes argument parsing, settings resolution and the launch runner

pub mod app;
pub mod config;

#[cfg(test)]
mod tests;
