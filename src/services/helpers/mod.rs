pub mod docker_helper;
pub mod system_helper;
