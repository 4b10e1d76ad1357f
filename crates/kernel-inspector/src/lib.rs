//! Live variable inspection for Jupyter kernels.
//!
//! An [`InspectionHandler`] attaches to one kernel through a [`KernelChannel`],
//! injects a small helper script for the kernel's language, and publishes an
//! [`UpdateEvent`] with the user's variables every time code runs. The
//! [`InspectorManager`] keeps one handler per session and forwards the active
//! session's updates to a [`VariableView`].
//!
//! ```no_run
//! use std::sync::Arc;
//! use kernel_inspector::{InspectorManager, JupyterChannel, SessionId};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let channel = Arc::new(JupyterChannel::from_connection_file("kernel-1234.json".as_ref()).await?);
//! let manager = InspectorManager::default();
//! let handler = manager.handler_for(SessionId::new("analysis.ipynb")?, channel).await;
//! manager.set_active(Some(handler));
//! let event = manager.inspect().await?;
//! for variable in event.variables {
//!     println!("{} {}", variable.name, variable.declared_type);
//! }
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod error;
#[cfg(any(test, feature = "test-utils"))]
pub mod fixtures;
pub mod handler;
pub mod jupyter_channel;
pub mod language;
pub mod manager;
pub mod matrix;
pub mod payload;
pub mod scripts;
pub mod session;
pub mod settings;
pub mod variable;

pub use channel::{KernelChannel, KernelMessage, KernelRequest, MessageContent, RequestHandle};
pub use error::{DecodeError, InspectError};
pub use handler::{HandlerState, InspectionHandler};
pub use jupyter_channel::JupyterChannel;
pub use language::KernelLanguage;
pub use manager::{InspectorManager, VariableView};
pub use matrix::MatrixModel;
pub use scripts::ScriptRegistry;
pub use session::SessionId;
pub use settings::InspectorSettings;
pub use variable::{UpdateEvent, UpdateTitle, Variable};
