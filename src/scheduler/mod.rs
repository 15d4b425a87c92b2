pub mod board;
pub mod grid;
pub mod handle;
pub mod job;
pub mod reconcile;
pub mod session;

pub use board::Board;
pub use grid::{Grid, GridDeps, GridStatus, Platform};
pub use handle::{GridHandle, GridMessage};
pub use job::{Job, JobId, JobState};
pub use session::{DockerImage, Session, SessionKind, SessionParams, SessionState};
