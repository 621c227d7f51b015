//! Process supervision: the only place the agent spawns or signals OS processes.

pub mod kill;
pub mod procfs;
pub mod supervisor;

pub use kill::kill;
pub use procfs::list_processes;
pub use supervisor::*;

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed waiting for {program}: {source}")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("process {0} not found")]
    ProcessNotFound(i32),
    #[error("refusing to signal protected pid {0}")]
    Protected(i32),
    #[error("failed to kill process {pid}: {source}")]
    Kill {
        pid: i32,
        #[source]
        source: std::io::Error,
    },
    #[error("script error: {0}")]
    Script(String),
}
