use std::{
    collections::BTreeMap,
    sync::Arc,
};

use config::schema::{
    AgentConfig,
    SinkConfig,
    SinkKind,
};
use core_types::Sink;
use dlq::{
    DlqWriter,
    FileDlqStore,
};
use net::ReqwestFetchClient;
use parking_lot::RwLock;
use runtime::Runtime;
use sinks::{
    http_stream::HttpStreamTransport,
    local_file::LocalFileTransport,
    message_bus::MessageBusTransport,
    SinkEngine,
};

/// Everything [`build_sinks`] produces: the live sink map the dispatcher
/// fans out to, plus each sink's concrete DLQ store (kept separately since
/// reprocessing needs [`FileDlqStore::reprocess`], not just the
/// object-safe [`DlqWriter::add_entry`]).
pub struct WiredSinks {
    pub sinks: Arc<RwLock<BTreeMap<String, Arc<dyn Sink>>>>,
    pub dlq_stores: Vec<(String, Arc<FileDlqStore>)>,
}

/// Builds one [`SinkEngine`] per configured sink, wrapping the `Transport`
/// its `kind` names. Unknown or malformed `options` fail the whole startup
/// rather than silently dropping a configured sink.
pub fn build_sinks<RT: Runtime>(runtime: &RT, config: &AgentConfig) -> anyhow::Result<WiredSinks> {
    let mut sinks: BTreeMap<String, Arc<dyn Sink>> = BTreeMap::new();
    let mut dlq_stores = Vec::new();

    for (name, sink_config) in &config.sinks {
        if !sink_config.enabled {
            continue;
        }
        let dlq = if config.dlq.enabled {
            let store = build_dlq_for_sink(runtime, config, name)?;
            dlq_stores.push((name.clone(), store.clone()));
            Some(store as Arc<dyn DlqWriter>)
        } else {
            None
        };
        let sink = build_one_sink(runtime.clone(), name, sink_config, dlq)?;
        sinks.insert(name.clone(), sink);
    }

    Ok(WiredSinks {
        sinks: Arc::new(RwLock::new(sinks)),
        dlq_stores,
    })
}

fn build_dlq_for_sink<RT: Runtime>(runtime: &RT, config: &AgentConfig, sink_name: &str) -> anyhow::Result<Arc<FileDlqStore>> {
    let directory = config.dlq.directory.join(sink_name);
    FileDlqStore::start(
        runtime.clone(),
        sink_name,
        directory,
        std::time::Duration::from_secs(1),
        config.dlq.retention,
    )
}

fn build_one_sink<RT: Runtime>(
    runtime: RT,
    name: &str,
    sink_config: &SinkConfig,
    dlq: Option<Arc<dyn DlqWriter>>,
) -> anyhow::Result<Arc<dyn Sink>> {
    let engine: Arc<dyn Sink> = match sink_config.kind {
        SinkKind::HttpStream => {
            let url = sink_config
                .options
                .get("url")
                .ok_or_else(|| anyhow::anyhow!("sink {name}: http_stream requires options.url"))?
                .clone();
            let fetch_client = Arc::new(ReqwestFetchClient::new(std::time::Duration::from_secs(30))?);
            let transport = HttpStreamTransport::new(name, url, fetch_client);
            SinkEngine::start(runtime, transport, sink_config.clone(), dlq)
        },
        SinkKind::MessageBus => {
            let brokers = sink_config
                .options
                .get("brokers")
                .ok_or_else(|| anyhow::anyhow!("sink {name}: message_bus requires options.brokers"))?;
            let topic = sink_config
                .options
                .get("topic")
                .ok_or_else(|| anyhow::anyhow!("sink {name}: message_bus requires options.topic"))?
                .clone();
            let transport = MessageBusTransport::new(name, brokers, topic)?;
            SinkEngine::start(runtime, transport, sink_config.clone(), dlq)
        },
        SinkKind::LocalFile => {
            let directory = sink_config
                .options
                .get("directory")
                .ok_or_else(|| anyhow::anyhow!("sink {name}: local_file requires options.directory"))?;
            let transport = LocalFileTransport::new(name, directory.into(), sink_config.max_open_files)?;
            SinkEngine::start(runtime, transport, sink_config.clone(), dlq)
        },
    };
    Ok(engine)
}
