pub mod attendance;
pub mod backup;
pub mod classes;
pub mod core;
pub mod enrollment;
pub mod logs;
pub mod students;
