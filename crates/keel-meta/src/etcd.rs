use std::sync::Arc;

use anyhow::Result;
use etcd_client::{
    Client, Compare, CompareOp, DeleteOptions, EventType, GetOptions, PutOptions, Txn, TxnOp,
    WatchOptions,
};
use tokio::sync::Mutex;
use tokio_stream::wrappers::ReceiverStream;

use crate::types::{CasOutcome, KvEntry, KvStore, WatchEvent, WatchStream};

#[derive(Clone)]
pub struct EtcdKvStore {
    client: Arc<Mutex<Client>>,
}

impl EtcdKvStore {
    pub async fn connect(endpoints: &[String]) -> Result<Self> {
        let c = Client::connect(endpoints, None).await?;
        Ok(Self {
            client: Arc::new(Mutex::new(c)),
        })
    }

    fn ttl_to_seconds(ttl_ms: u64) -> i64 {
        let secs = ttl_ms.div_ceil(1000) as i64;
        secs.max(1)
    }
}

#[async_trait::async_trait]
impl KvStore for EtcdKvStore {
    async fn put(&self, key: &str, value: Vec<u8>, ttl_ms: Option<u64>) -> Result<u64> {
        let mut cli = self.client.lock().await;

        let mut opts = PutOptions::new();
        if let Some(ttl_ms) = ttl_ms {
            let lease = cli.lease_grant(Self::ttl_to_seconds(ttl_ms), None).await?;
            opts = opts.with_lease(lease.id());
        }

        let resp = cli.put(key, value, Some(opts)).await?;
        let rev = resp.header().map(|h| h.revision()).unwrap_or_default();
        Ok(rev as u64)
    }

    async fn get(&self, key: &str) -> Result<Option<KvEntry>> {
        let mut cli = self.client.lock().await;
        let resp = cli.get(key, None).await?;
        Ok(resp.kvs().first().map(|kv| KvEntry {
            key: key.to_string(),
            value: kv.value().to_vec(),
            revision: kv.mod_revision() as u64,
        }))
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut cli = self.client.lock().await;
        let resp = cli.delete(key, None).await?;
        Ok(resp.deleted() > 0)
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64> {
        let mut cli = self.client.lock().await;
        let resp = cli
            .delete(prefix, Some(DeleteOptions::new().with_prefix()))
            .await?;
        Ok(resp.deleted().max(0) as u64)
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<KvEntry>> {
        let mut cli = self.client.lock().await;
        let resp = cli.get(prefix, Some(GetOptions::new().with_prefix())).await?;

        Ok(resp
            .kvs()
            .iter()
            .map(|kv| KvEntry {
                key: String::from_utf8_lossy(kv.key()).to_string(),
                value: kv.value().to_vec(),
                revision: kv.mod_revision() as u64,
            })
            .collect())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected_revision: u64,
        value: Vec<u8>,
    ) -> Result<CasOutcome> {
        let mut cli = self.client.lock().await;

        // A missing key has create_revision 0, which is how put-if-absent is expressed.
        let cmp = if expected_revision == 0 {
            Compare::create_revision(key, CompareOp::Equal, 0)
        } else {
            Compare::mod_revision(key, CompareOp::Equal, expected_revision as i64)
        };
        let put = TxnOp::put(key, value, None);
        let txn = Txn::new().when([cmp]).and_then([put]).or_else([]);
        let resp = cli.txn(txn).await?;

        if resp.succeeded() {
            let rev = resp.header().map(|h| h.revision()).unwrap_or_default();
            return Ok(CasOutcome::Swapped {
                revision: rev as u64,
            });
        }

        let current = cli.get(key, None).await?;
        let current_revision = current
            .kvs()
            .first()
            .map(|kv| kv.mod_revision() as u64)
            .unwrap_or(0);
        Ok(CasOutcome::Conflict { current_revision })
    }

    async fn watch_prefix(
        &self,
        prefix: &str,
        start_revision_exclusive: Option<u64>,
    ) -> Result<WatchStream> {
        let mut cli = self.client.lock().await;

        let mut opts = WatchOptions::new().with_prefix();
        if let Some(min_rev) = start_revision_exclusive {
            // etcd start_revision is inclusive
            opts = opts.with_start_revision(min_rev.saturating_add(1) as i64);
        }

        let (watcher, mut stream) = cli.watch(prefix, Some(opts)).await?;

        let (tx, rx) = tokio::sync::mpsc::channel::<WatchEvent>(1024);
        tokio::spawn(async move {
            // The watch is cancelled server-side once the watcher is dropped.
            let _watcher = watcher;
            while let Ok(Some(resp)) = stream.message().await {
                for ev in resp.events() {
                    let Some(kv) = ev.kv() else { continue };
                    let value = match ev.event_type() {
                        EventType::Put => Some(kv.value().to_vec()),
                        EventType::Delete => None,
                    };
                    let event = WatchEvent {
                        key: String::from_utf8_lossy(kv.key()).to_string(),
                        value,
                        revision: kv.mod_revision() as u64,
                    };
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}
