pub mod clock;
pub mod harvester;
pub mod queue;
pub mod retry;
pub mod runtime;
pub mod snapshotter;
pub mod stream;
pub mod updater;

#[cfg(test)]
mod tests;
