pub mod certificates;
pub mod core;
pub mod host;
pub mod learners;
pub mod milestones;
pub mod setup;
pub mod templates;
pub mod trainings;
