use std::sync::Arc;

use profiler_protocol::Message;
use profiler_store::CallRecordStore;
use profiler_symbols::{MetadataCache, SymbolResolver};

/// The frontend's single-threaded "apartment" (§5): the store and the
/// symbol resolver are only ever touched from here, so every message from
/// every session is funneled through one `Dispatcher::handle` call at a
/// time. I/O (accepting connections, reading frames) happens around this,
/// never inside it.
pub struct Dispatcher {
    store: CallRecordStore,
    resolver: SymbolResolver,
    cache: Option<Arc<dyn MetadataCache>>,
}

impl Dispatcher {
    pub fn new(cache: Option<Arc<dyn MetadataCache>>) -> Self {
        Dispatcher {
            store: CallRecordStore::new(),
            resolver: SymbolResolver::new(),
            cache,
        }
    }

    pub fn store(&self) -> &CallRecordStore {
        &self.store
    }

    pub fn resolver(&self) -> &SymbolResolver {
        &self.resolver
    }

    /// Applies one incoming message's effects and returns whatever messages
    /// should be sent back on the session it arrived on.
    pub fn handle(&mut self, message: Message) -> Vec<Message> {
        match message {
            Message::Init {
                executable,
                ticks_per_second,
            } => {
                log::info!("session init: {executable} ({ticks_per_second} ticks/s)");
                Vec::new()
            }

            Message::ModulesLoaded { mappings } => {
                for mapping in mappings {
                    self.resolver.on_module_loaded(mapping);
                }
                Vec::new()
            }

            Message::ModulesUnloaded { mapping_ids } => {
                for id in mapping_ids {
                    self.resolver.on_module_unloaded(id);
                }
                Vec::new()
            }

            Message::RequestModuleMetadata { token, module_id } => {
                let metadata = self
                    .cache
                    .as_ref()
                    .and_then(|cache| match cache.load_module(module_id) {
                        Ok(metadata) => metadata,
                        Err(e) => {
                            log::warn!("metadata cache degraded: {e}");
                            None
                        }
                    });
                if let Some(metadata) = metadata.clone() {
                    self.resolver.set_metadata(metadata);
                }
                vec![Message::ModuleMetadata {
                    token,
                    module_id,
                    metadata,
                }]
            }

            Message::ModuleMetadata {
                module_id,
                metadata: Some(metadata),
                ..
            } => {
                if let Some(cache) = &self.cache {
                    if let Err(e) = cache.store_module(&metadata) {
                        log::warn!("metadata cache degraded: {e}");
                    }
                }
                self.resolver.set_metadata(metadata);
                let _ = module_id;
                Vec::new()
            }

            Message::ModuleMetadata { .. } => Vec::new(),

            Message::RequestStatisticsUpdate { .. } => Vec::new(),

            Message::StatisticsUpdate { deltas } => {
                for delta in deltas.into_values().flatten() {
                    if let Err(e) = self.store.ingest(&delta) {
                        log::warn!("dropping malformed statistics delta: {e}");
                    }
                }
                Vec::new()
            }

            Message::ThreadsInfo { threads } => {
                log::debug!("{} thread(s) reported", threads.len());
                Vec::new()
            }

            Message::ApplyPatches { .. } | Message::RevertPatches { .. } => Vec::new(),

            Message::PatchResult {
                module_id,
                outcomes,
                ..
            } => {
                if let Some(cache) = &self.cache {
                    for outcome in outcomes {
                        if matches!(outcome.state, profiler_types::PatchState::Active) {
                            if let Err(e) = cache.record_patch(module_id, outcome.rva) {
                                log::warn!("metadata cache degraded: {e}");
                            }
                        }
                    }
                }
                Vec::new()
            }
        }
    }
}

/// Identifies which session an inbound message came from / an outbound
/// batch of responses is destined for, across the channel boundary between
/// the I/O thread and the apartment thread.
pub type SessionId = mio::Token;

/// Runs a [`Dispatcher`] on its own thread, realizing the single-threaded
/// apartment of §5 as an `mpsc` command queue plus a dedicated worker —
/// the I/O side (accepting connections, buffering partial frames) never
/// touches the store or resolver directly, it only feeds and drains queues.
pub struct Apartment {
    inbound: std::sync::mpsc::Sender<(SessionId, Message)>,
    outbound: std::sync::mpsc::Receiver<(SessionId, Vec<Message>)>,
    _worker: std::thread::JoinHandle<()>,
}

impl Apartment {
    /// `waker`, when given, is pinged after every response batch so a
    /// `mio::Poll` loop blocked with no timeout wakes up to drain it instead
    /// of waiting for the next socket readiness event.
    pub fn spawn(cache: Option<Arc<dyn MetadataCache>>, waker: Option<Arc<mio::Waker>>) -> Self {
        let (inbound_tx, inbound_rx) = std::sync::mpsc::channel::<(SessionId, Message)>();
        let (outbound_tx, outbound_rx) = std::sync::mpsc::channel();
        let worker = std::thread::Builder::new()
            .name("profiler-apartment".to_string())
            .spawn(move || {
                let mut dispatcher = Dispatcher::new(cache);
                for (session, message) in inbound_rx {
                    let responses = dispatcher.handle(message);
                    if outbound_tx.send((session, responses)).is_err() {
                        break;
                    }
                    if let Some(waker) = &waker {
                        let _ = waker.wake();
                    }
                }
            })
            .expect("spawning the apartment worker thread");
        Apartment {
            inbound: inbound_tx,
            outbound: outbound_rx,
            _worker: worker,
        }
    }

    /// Queues one message for the apartment thread; non-blocking. Silently
    /// drops the message if the apartment has already shut down, matching
    /// the benign-race policy of §7 (the I/O side is tearing down too).
    pub fn submit(&self, session: SessionId, message: Message) {
        let _ = self.inbound.send((session, message));
    }

    /// Drains every response batch currently queued, without blocking.
    pub fn try_drain(&self) -> Vec<(SessionId, Vec<Message>)> {
        self.outbound.try_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use profiler_symbols::SqliteMetadataCache;
    use profiler_types::{CallRecordDelta, Id, ModuleId, ModuleMapping, ROOT_CALL_ID};
    use std::collections::HashMap;

    #[test]
    fn modules_loaded_feed_the_resolver() {
        let mut dispatcher = Dispatcher::new(None);
        dispatcher.handle(Message::ModulesLoaded {
            mappings: vec![ModuleMapping {
                id: Id(1),
                module_id: ModuleId(1),
                base_address: 0x1000,
                path: "/lib/a.so".to_string(),
            }],
        });
        assert!(dispatcher.resolver().resolve(0x1050).is_some());
    }

    #[test]
    fn statistics_update_ingests_into_the_store() {
        let mut dispatcher = Dispatcher::new(None);
        let mut deltas = HashMap::new();
        deltas.insert(
            Id(1),
            vec![CallRecordDelta {
                thread_id: Id(1),
                parent_id: ROOT_CALL_ID,
                address: 0x501,
                times_called: 1,
                inclusive_time: 10,
                exclusive_time: 10,
                max_reentrance: 0,
                max_call_time: 10,
                histogram: None,
            }],
        );
        dispatcher.handle(Message::StatisticsUpdate { deltas });
        assert_eq!(dispatcher.store().len(), 1);
    }

    #[test]
    fn request_module_metadata_without_a_cache_responds_with_none() {
        let mut dispatcher = Dispatcher::new(None);
        let responses = dispatcher.handle(Message::RequestModuleMetadata {
            token: 7,
            module_id: ModuleId(1),
        });
        assert!(matches!(
            responses.as_slice(),
            [Message::ModuleMetadata { token: 7, metadata: None, .. }]
        ));
    }

    #[test]
    fn request_module_metadata_hits_the_cache_when_present() {
        let cache: Arc<dyn MetadataCache> = Arc::new(SqliteMetadataCache::open_in_memory().unwrap());
        cache
            .store_module(&profiler_types::ModuleMetadata {
                module_id: ModuleId(42),
                ..Default::default()
            })
            .unwrap();

        let mut dispatcher = Dispatcher::new(Some(cache));
        let responses = dispatcher.handle(Message::RequestModuleMetadata {
            token: 1,
            module_id: ModuleId(42),
        });
        assert!(matches!(
            responses.as_slice(),
            [Message::ModuleMetadata { metadata: Some(_), .. }]
        ));
    }

    #[test]
    fn apartment_round_trips_a_request_through_its_worker_thread() {
        let apartment = Apartment::spawn(None, None);
        apartment.submit(
            mio::Token(2),
            Message::RequestModuleMetadata {
                token: 1,
                module_id: ModuleId(1),
            },
        );

        let mut batches = Vec::new();
        for _ in 0..1000 {
            batches = apartment.try_drain();
            if !batches.is_empty() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        assert_eq!(batches.len(), 1);
        let (session, responses) = &batches[0];
        assert_eq!(*session, mio::Token(2));
        assert!(matches!(
            responses.as_slice(),
            [Message::ModuleMetadata { metadata: None, .. }]
        ));
    }
}
