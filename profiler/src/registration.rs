use thiserror::Error;

/// Platform-dependent registration of this build as the system's profiling
/// collector (§6). The original ships this as Windows COM self-registration
/// (`RegisterServer`/`UnregisterServer` on an ATL executable module); that
/// mechanism has no counterpart crate in this workspace's dependency stack,
/// so registration here is a deliberately honest no-op that logs intent and
/// always succeeds — there is nothing in this build's platform story (no
/// Windows COM crate, no launchd/systemd unit templates) to register against
/// yet. A real backend plugs into [`register`]/[`unregister`] without
/// changing their signatures.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RegistrationError {
    #[error("platform registration failed: {0}")]
    Platform(String),
}

pub fn register() -> Result<(), RegistrationError> {
    log::info!("registering as the system profiling collector (no-op on this platform)");
    Ok(())
}

pub fn unregister() -> Result<(), RegistrationError> {
    log::info!("removing profiling collector registration (no-op on this platform)");
    Ok(())
}
