// ============================================================================
// Shuttle Library
// ============================================================================

pub mod conditions;
pub mod config;
pub mod coordinator;
pub mod core;
pub mod fxs;
pub mod ledger;
pub mod notify;
pub mod plugin;
pub mod state;
pub mod store;
pub mod supervisor;

// Re-export main types for convenience
pub use core::{
    ConditionsSample, ConditionsValueSet, Result, RunBound, RunNumber, ShuttleError, TimeWindow,
    ValidityRange, Value,
};

pub use conditions::{ArchiveClient, ArchiveError, ConditionsArchive, SignalKind};
pub use config::{ArchiveEndpoint, ShuttleConfig, StorePaths, SubsystemConfig};
pub use coordinator::{CoordinatorServices, PassReport, RunCoordinator, SubsystemReport};
pub use fxs::{FileExchangeClient, FileExchangeServer, FxsSystem, LocalFxsServer};
pub use ledger::{FileRunLedger, Run, RunLedger};
pub use notify::{JsonlNotifier, Notifier, OperatorAlert, StatusUpdate, TracingNotifier};
pub use plugin::{
    AttemptOutcome, Plugin, PluginContext, PluginError, PluginExecutor, PluginJob,
    PluginRegistry, PluginServices, ProcessExecutor, StoreOptions, builtin, invoke,
};
pub use state::{Decision, StatusStore, SubsystemState, SubsystemStatus};
pub use store::{
    CommitOutcome, DiscardReason, FileObjectStore, ObjectHeader, ObjectId, ObjectMetadata,
    ObjectPath, ObjectStore, ObjectStoreGateway, ReconcileReport, StorageKind, StoredObject,
};
pub use supervisor::{PluginInvocation, SubprocessSupervisor, SupervisedExit};
