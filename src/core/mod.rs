pub mod engine;
pub mod envelope;
pub mod lifecycle;
pub mod poster;
pub mod reflect;

pub use engine::{Engine, EngineError, EngineHost, validate_version};
pub use envelope::{CallArgs, RemoteError};
pub use lifecycle::{Lifecycle, LifecycleError, ServerState};
pub use poster::{EngineLoop, HostingMode, Job, PostError, Poster, PosterAdapter, on_engine_thread};
pub use reflect::{EndpointKind, Reflected, Reflector, Remote, Target};
