//! The persistence bridge.
//!
//! Producers publish [`DataEvent`]s and [`FoiEvent`]s on the bus; the
//! bridge subscribes on their behalf and materialises what it sees:
//! systems on first sighting, data streams from the record description
//! attached to the event, features of interest on FOI events, and one
//! stored observation per record.
//!
//! A producer is registered explicitly and owned through its
//! [`ProducerHandle`]; stopping the handle cancels the bridge's
//! subscriptions and drains in-flight deliveries.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use sonde_bus::{EventBus, SubscribeOptions, Subscription};
use sonde_datastore::{DatastoreError, ObsDatabase};
use sonde_types::{
    topics, DataComponent, DataEvent, EventKind, EventKindSet, FoiEvent, HubEvent, InternalId,
    ObsData, RecordEncoding, SystemDesc, NO_FOI,
};

/// Errors raised while bridging producer events into the stores.
#[derive(Debug, Error)]
pub enum IngestError {
    /// The event referenced a FOI UID the store has never seen. The event
    /// is rejected; the subscription survives.
    #[error("unknown FOI {0}")]
    UnknownFoi(String),

    /// The event referenced an output with no registered stream and
    /// carried no record description to create one from.
    #[error("no record description for output {0}")]
    SchemaMissing(String),

    /// A record's value count does not match the stream's schema.
    #[error("record has {got} values, schema expects {expected}")]
    RecordArity { got: usize, expected: usize },

    #[error(transparent)]
    Store(#[from] DatastoreError),
}

/// Per-output state cached by the bridge.
struct StreamEntry {
    stream_id: InternalId,
    /// Depth-first index of the phenomenon-time leaf, if the schema has one.
    time_index: Option<usize>,
    flat_len: usize,
}

struct SystemState {
    current_foi: InternalId,
    streams: HashMap<String, StreamEntry>,
}

struct SystemEntry {
    system_id: InternalId,
    state: Mutex<SystemState>,
}

struct BridgeInner {
    db: Arc<ObsDatabase>,
    bus: EventBus,
    systems: Mutex<HashMap<String, Arc<SystemEntry>>>,
}

/// The bridge between the bus and the stores.
#[derive(Clone)]
pub struct IngestBridge {
    inner: Arc<BridgeInner>,
}

/// One output a producer declares at registration.
pub struct ProducerOutput {
    pub name: String,
    pub schema: DataComponent,
    pub encoding: RecordEncoding,
}

/// Owns the bridge's subscriptions for one registered producer.
pub struct ProducerHandle {
    stop: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl ProducerHandle {
    /// Cancels the bridge subscriptions and waits for in-flight
    /// deliveries to drain.
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "bridge drain task panicked");
            }
        }
    }
}

/// Demand window kept open on each bridge subscription.
const BRIDGE_DEMAND: u64 = 1024;

impl IngestBridge {
    pub fn new(db: Arc<ObsDatabase>, bus: EventBus) -> Self {
        IngestBridge {
            inner: Arc::new(BridgeInner {
                db,
                bus,
                systems: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Registers a producer: ensures its system entity and output streams
    /// exist, announces them on the bus, and starts draining the
    /// producer's topics into the stores.
    pub fn register_producer(
        &self,
        desc: SystemDesc,
        outputs: Vec<ProducerOutput>,
    ) -> Result<ProducerHandle, IngestError> {
        let uid = desc.uid().to_string();
        let system_id = self.ensure_system(desc)?;

        for output in &outputs {
            self.ensure_stream(&uid, system_id, &output.name, Some(&output.schema), output.encoding)?;
        }

        let (stop, _) = watch::channel(false);
        let mut tasks = Vec::with_capacity(outputs.len() + 1);

        let status_sub = self.inner.bus.subscribe(
            &topics::system_status(&uid),
            SubscribeOptions::default()
                .with_demand(BRIDGE_DEMAND)
                .with_kinds(EventKindSet::of(&[EventKind::Foi, EventKind::Data])),
        );
        tasks.push(self.spawn_drain(status_sub, stop.subscribe()));

        for output in &outputs {
            let sub = self.inner.bus.subscribe(
                &topics::data_stream(&uid, &output.name),
                SubscribeOptions::default()
                    .with_demand(BRIDGE_DEMAND)
                    .with_kinds(EventKindSet::of(&[EventKind::Data])),
            );
            tasks.push(self.spawn_drain(sub, stop.subscribe()));
        }

        Ok(ProducerHandle { stop, tasks })
    }

    fn spawn_drain(
        &self,
        mut sub: Subscription,
        mut stop: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let bridge = self.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = stop.changed() => {
                        sub.cancel();
                        // Drain anything already queued before exiting.
                        while let Some(event) = sub.try_recv() {
                            bridge.dispatch(event).await;
                        }
                        return;
                    }
                    event = sub.recv() => match event {
                        Some(event) => event,
                        None => return,
                    },
                };
                sub.request(1);
                bridge.dispatch(event).await;
            }
        })
    }

    async fn dispatch(&self, event: HubEvent) {
        let bridge = self.clone();
        let result = tokio::task::spawn_blocking(move || match event {
            HubEvent::Data(ref data) => bridge.handle_data_event(data).map(|_| ()),
            HubEvent::Foi(ref foi) => bridge.handle_foi_event(foi),
            _ => Ok(()),
        })
        .await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, "producer event rejected"),
            Err(e) => tracing::error!(error = %e, "bridge handler panicked"),
        }
    }

    /// Persists one data event; returns the number of observations stored.
    pub fn handle_data_event(&self, event: &DataEvent) -> Result<usize, IngestError> {
        let entry = self.resolve_system(&event.system_uid)?;

        let (stream_id, time_index, flat_len, current_foi) = {
            let mut state = entry.state.lock().expect("system state lock poisoned");
            if !state.streams.contains_key(&event.output_name) {
                drop(state);
                self.ensure_stream(
                    &event.system_uid,
                    entry.system_id,
                    &event.output_name,
                    event.schema.as_ref(),
                    RecordEncoding::Json,
                )?;
                state = entry.state.lock().expect("system state lock poisoned");
            }
            let stream = state
                .streams
                .get(&event.output_name)
                .expect("stream cached by ensure_stream");
            (
                stream.stream_id,
                stream.time_index,
                stream.flat_len,
                state.current_foi,
            )
        };

        let foi_id = match &event.foi_uid {
            Some(uid) => match self.inner.db.fois().uid_to_id(uid)? {
                Some(id) => id,
                None => return Err(IngestError::UnknownFoi(uid.clone())),
            },
            None => current_foi,
        };

        let mut stored = 0;
        for record in &event.records {
            if record.len() != flat_len {
                return Err(IngestError::RecordArity {
                    got: record.len(),
                    expected: flat_len,
                });
            }
            let phenomenon_time = time_index
                .and_then(|i| record.get(i))
                .and_then(|v| v.as_timestamp())
                .unwrap_or(event.timestamp);

            let mut obs = ObsData::new(stream_id, phenomenon_time, record.clone());
            if foi_id != NO_FOI {
                obs = obs.with_foi(foi_id);
            }
            self.inner.db.observations().add(obs)?;
            stored += 1;
        }
        Ok(stored)
    }

    /// Upserts the FOI and makes it the producing system's current FOI,
    /// inherited by subsequent observations until the next FOI event.
    pub fn handle_foi_event(&self, event: &FoiEvent) -> Result<(), IngestError> {
        let fois = self.inner.db.fois();
        let foi_id = match fois.current_version_by_uid(&event.foi.uid)? {
            Some((key, current)) => {
                // Valid time is store-assigned; compare content only, or
                // every repeated FOI event would append a version.
                let differs = current.name != event.foi.name
                    || current.description != event.foi.description
                    || current.feature_type != event.foi.feature_type
                    || current.geometry != event.foi.geometry
                    || current.properties != event.foi.properties;
                if differs {
                    fois.add_version(event.foi.clone())?;
                }
                key.internal_id
            }
            None => fois.add(event.foi.clone())?.internal_id,
        };

        let entry = self.resolve_system(&event.system_uid)?;
        entry
            .state
            .lock()
            .expect("system state lock poisoned")
            .current_foi = foi_id;
        Ok(())
    }

    /// Cache-first system resolution; creates the entity on first miss.
    fn resolve_system(&self, uid: &str) -> Result<Arc<SystemEntry>, IngestError> {
        if let Some(entry) = self
            .inner
            .systems
            .lock()
            .expect("systems lock poisoned")
            .get(uid)
        {
            return Ok(Arc::clone(entry));
        }
        let system_id = self.ensure_system(SystemDesc::new(uid, uid))?;
        Ok(self.cache_system(uid, system_id))
    }

    fn cache_system(&self, uid: &str, system_id: InternalId) -> Arc<SystemEntry> {
        let mut systems = self.inner.systems.lock().expect("systems lock poisoned");
        Arc::clone(systems.entry(uid.to_string()).or_insert_with(|| {
            Arc::new(SystemEntry {
                system_id,
                state: Mutex::new(SystemState {
                    current_foi: NO_FOI,
                    streams: HashMap::new(),
                }),
            })
        }))
    }

    /// Resolves or creates the system entity, versioning the stored
    /// description when the incoming one differs.
    fn ensure_system(&self, desc: SystemDesc) -> Result<InternalId, IngestError> {
        let systems = self.inner.db.systems();
        let uid = desc.uid().to_string();
        let system_id = match systems.current_version_by_uid(&uid)? {
            Some((key, current)) => {
                let differs = current.feature.name != desc.feature.name
                    || current.feature.description != desc.feature.description
                    || current.feature.geometry != desc.feature.geometry;
                if differs {
                    systems.add_version(desc)?;
                    self.inner.bus.publish(
                        topics::REGISTRY,
                        HubEvent::SystemChanged {
                            system_uid: uid.clone(),
                        },
                    );
                }
                key.internal_id
            }
            None => {
                let name = desc.feature.name.clone();
                let key = systems.add(desc)?;
                self.inner.bus.publish(
                    topics::REGISTRY,
                    HubEvent::SystemAdded {
                        system_uid: uid.clone(),
                        name,
                    },
                );
                key.internal_id
            }
        };
        self.cache_system(&uid, system_id);
        Ok(system_id)
    }

    /// Resolves or creates the stream for one output and refreshes the
    /// cached time indexer.
    fn ensure_stream(
        &self,
        system_uid: &str,
        system_id: InternalId,
        output_name: &str,
        schema: Option<&DataComponent>,
        encoding: RecordEncoding,
    ) -> Result<InternalId, IngestError> {
        let streams = self.inner.db.data_streams();
        let (stream_id, schema_owned, created) = match schema {
            Some(schema) => {
                let before = streams.latest_for_output(system_id, output_name)?;
                let reg =
                    streams.register_output(system_id, output_name, schema.clone(), encoding)?;
                (reg.stream_id, schema.clone(), before.is_none())
            }
            None => match streams.latest_for_output(system_id, output_name)? {
                Some((id, info)) => (id, info.record_schema, false),
                None => return Err(IngestError::SchemaMissing(output_name.to_string())),
            },
        };

        if created {
            self.inner.bus.publish(
                &topics::system_status(system_uid),
                HubEvent::DataStreamAdded {
                    system_uid: system_uid.to_string(),
                    output_name: output_name.to_string(),
                },
            );
        }

        let entry = self.resolve_system_entry(system_uid, system_id);
        entry
            .state
            .lock()
            .expect("system state lock poisoned")
            .streams
            .insert(
                output_name.to_string(),
                StreamEntry {
                    stream_id,
                    time_index: schema_owned.time_leaf_index(),
                    flat_len: schema_owned.flat_len(),
                },
            );
        Ok(stream_id)
    }

    fn resolve_system_entry(&self, uid: &str, system_id: InternalId) -> Arc<SystemEntry> {
        self.cache_system(uid, system_id)
    }
}
