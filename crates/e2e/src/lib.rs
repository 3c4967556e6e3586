//! Installer end-to-end test harness
//!
//! Boots a throwaway VM with the graphical installer, walks the installer
//! wizard through a browser, checks the installed system and always tears
//! the VM down again.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     TestRunner                              │
//! │    ├── VirtInstallMachine::start()                          │
//! │    │     ├── FileServer (payload)    -> ServedPayload       │
//! │    │     ├── ImagePatcher::patch()   -> PatchedImage        │
//! │    │     ├── FileServer (updates.img)                       │
//! │    │     ├── BootPlan -> virt-install (CommandRunner)       │
//! │    │     └── Guest::wait_boot() + web UI readiness marker   │
//! │    ├── InstallerWorkflow::run()                             │
//! │    │     ├── open -> language -> storage -> encryption      │
//! │    │     ├── users -> review -> install -> progress         │
//! │    │     ├── post install -> reboot (logs collected here)   │
//! │    │     └── installed system checks                        │
//! │    │         (each screen customisable via StageHandlers)   │
//! │    └── teardown(): logs unless already collected, kill()    │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod boot_image;
pub mod command;
pub mod config;
pub mod error;
pub mod guest;
pub mod machine;
pub mod playwright;
pub mod port;
pub mod runner;
pub mod screens;
pub mod server;
pub mod spec;
pub mod teardown;
pub mod workflow;

pub use config::HarnessConfig;
pub use error::{E2eError, E2eResult};
pub use machine::{MachineSession, MachineState, VirtInstallMachine};
pub use runner::{TestResult, TestRunner};
pub use spec::{Scenario, UiStep};
pub use workflow::{DefaultStages, InstallerWorkflow, ScriptedStages, Stage, StageHandlers, WorkflowState};
