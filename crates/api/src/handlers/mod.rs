pub mod backends;
pub mod job_groups;
