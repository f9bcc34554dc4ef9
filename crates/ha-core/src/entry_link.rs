//! Back-channel from a coordinator to the config entry that owns it

use futures::future::BoxFuture;

/// Async cleanup registered during setup and run when the entry unloads
pub type UnloadHook = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// What a coordinator may ask of its config entry
///
/// The config entry owns the coordinator; the coordinator only holds this
/// link so it can report auth failures, honour the entry's polling
/// preference and tie its own shutdown to the entry's unload.
pub trait EntryLink: Send + Sync {
    fn entry_id(&self) -> &str;

    fn title(&self) -> &str;

    /// The user turned off background polling for this entry
    fn polling_disabled(&self) -> bool;

    /// Start a reauthentication flow for the entry
    fn start_reauth(&self, reason: &str);

    /// Run `hook` when the entry unloads, after its platforms are unloaded
    fn on_unload(&self, hook: UnloadHook);
}
