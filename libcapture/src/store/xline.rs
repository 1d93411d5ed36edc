use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{
    Client, Compare, CompareOp, ConnectOptions, GetOptions, KvClient, PutOptions, Txn, TxnOp,
    TxnOpResponse,
};
use log::{debug, warn};
use serde::Deserialize;
use tokio::sync::{Mutex, MutexGuard};

use super::{CoordinationStore, StoreError};

#[derive(Debug, Clone, Deserialize)]
pub struct XlineConfig {
    #[serde(default)]
    pub endpoints: Vec<String>,
    #[serde(default = "default_prefix")]
    pub prefix: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

fn default_prefix() -> String {
    "/capd".to_string()
}

/// Coordination store backed by an etcd v3 compatible server (xline, etcd).
///
/// Key layout under the configured prefix:
/// - `{prefix}/hash/{hex(hash)}/{field}`
/// - `{prefix}/set/{hex(set)}/{member}`
/// - `{prefix}/key/{key}`
///
/// Hash and set names are hex encoded so that a name containing `/` can
/// never shadow the prefix range of another name.
#[derive(Clone)]
pub struct XlineStore {
    cli: Arc<Mutex<Client>>,
    kv_api: Arc<Mutex<KvClient>>,
    prefix: String,
}

impl XlineStore {
    pub async fn new(config: &XlineConfig) -> Result<Self, StoreError> {
        let opts = if let (Some(user), Some(pass)) = (&config.username, &config.password) {
            ConnectOptions::default().with_user(user.clone(), pass.clone())
        } else {
            ConnectOptions::default()
        };

        let cli = Client::connect(config.endpoints.clone(), Some(opts)).await?;
        let kv = cli.kv_client();
        Ok(Self {
            cli: Arc::new(Mutex::new(cli)),
            kv_api: Arc::new(Mutex::new(kv)),
            prefix: config.prefix.trim_end_matches('/').to_string(),
        })
    }

    async fn kv(&self) -> MutexGuard<'_, KvClient> {
        self.kv_api.lock().await
    }

    async fn cli(&self) -> MutexGuard<'_, Client> {
        self.cli.lock().await
    }

    fn hash_prefix(&self, hash: &str) -> String {
        format!("{}/hash/{}/", self.prefix, hex::encode(hash))
    }

    fn hash_key(&self, hash: &str, field: &str) -> String {
        format!("{}{}", self.hash_prefix(hash), field)
    }

    fn set_prefix(&self, set: &str) -> String {
        format!("{}/set/{}/", self.prefix, hex::encode(set))
    }

    fn set_key(&self, set: &str, member: &str) -> String {
        format!("{}{}", self.set_prefix(set), member)
    }

    fn plain_key(&self, key: &str) -> String {
        format!("{}/key/{}", self.prefix, key)
    }
}

#[async_trait]
impl CoordinationStore for XlineStore {
    async fn hexists(&self, hash: &str, field: &str) -> Result<bool, StoreError> {
        let key = self.hash_key(hash, field);
        let resp = self
            .kv()
            .await
            .get(key, Some(GetOptions::new().with_count_only()))
            .await?;
        Ok(resp.count() > 0)
    }

    async fn hget(&self, hash: &str, field: &str) -> Result<Option<String>, StoreError> {
        let key = self.hash_key(hash, field);
        let resp = self.kv().await.get(key, None).await?;
        match resp.kvs().first() {
            Some(kv) => Ok(Some(std::str::from_utf8(kv.value())?.to_string())),
            None => Ok(None),
        }
    }

    async fn hset(&self, hash: &str, field: &str, value: &str) -> Result<(), StoreError> {
        let key = self.hash_key(hash, field);
        self.kv().await.put(key, value, None).await?;
        Ok(())
    }

    async fn hdel(&self, hash: &str, field: &str) -> Result<bool, StoreError> {
        let key = self.hash_key(hash, field);
        let resp = self.kv().await.delete(key, None).await?;
        Ok(resp.deleted() > 0)
    }

    async fn hgetall(&self, hash: &str) -> Result<Vec<(String, String)>, StoreError> {
        let prefix = self.hash_prefix(hash);
        let resp = self
            .kv()
            .await
            .get(prefix.clone(), Some(GetOptions::new().with_prefix()))
            .await?;

        let mut entries = Vec::with_capacity(resp.kvs().len());
        for kv in resp.kvs() {
            let key = std::str::from_utf8(kv.key())?;
            let Some(field) = key.strip_prefix(&prefix) else {
                warn!("Ignoring key {key} outside of hash prefix {prefix}");
                continue;
            };
            entries.push((field.to_string(), std::str::from_utf8(kv.value())?.to_string()));
        }
        Ok(entries)
    }

    async fn set_nx_ex(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let key = self.plain_key(key);
        let ttl_secs = ttl.as_secs().max(1) as i64;

        let lease_resp = self
            .cli()
            .await
            .lease_client()
            .grant(ttl_secs, None)
            .await?;
        let lease_id = lease_resp.id();

        let put_op = TxnOp::put(
            key.clone(),
            value,
            Some(PutOptions::new().with_lease(lease_id)),
        );
        let cmp = Compare::version(key.clone(), CompareOp::Equal, 0);
        let txn = Txn::new().when([cmp]).and_then([put_op]);

        let result = self.cli().await.txn(txn).await;
        let txn_resp = match result {
            Ok(resp) => resp,
            Err(e) => {
                let _ = self.cli().await.lease_revoke(lease_id).await;
                return Err(e.into());
            }
        };

        if !txn_resp.succeeded() {
            debug!("{key} already held, revoking unused lease {lease_id}");
            let _ = self.cli().await.lease_revoke(lease_id).await;
            return Ok(false);
        }
        Ok(true)
    }

    async fn del(&self, key: &str) -> Result<bool, StoreError> {
        let key = self.plain_key(key);
        let resp = self.kv().await.delete(key, None).await?;
        Ok(resp.deleted() > 0)
    }

    async fn sadd(&self, set: &str, member: &str) -> Result<bool, StoreError> {
        let key = self.set_key(set, member);
        let resp = self
            .kv()
            .await
            .put(key, "", Some(PutOptions::new().with_prev_key()))
            .await?;
        Ok(resp.prev_key().is_none())
    }

    async fn smembers(&self, set: &str) -> Result<Vec<String>, StoreError> {
        let prefix = self.set_prefix(set);
        let resp = self
            .kv()
            .await
            .get(
                prefix.clone(),
                Some(GetOptions::new().with_prefix().with_keys_only()),
            )
            .await?;

        let mut members = Vec::with_capacity(resp.kvs().len());
        for kv in resp.kvs() {
            let key = std::str::from_utf8(kv.key())?;
            if let Some(member) = key.strip_prefix(&prefix) {
                members.push(member.to_string());
            }
        }
        Ok(members)
    }

    async fn sismember_many(&self, probes: &[(&str, &str)]) -> Result<Vec<bool>, StoreError> {
        if probes.is_empty() {
            return Ok(Vec::new());
        }
        let ops: Vec<TxnOp> = probes
            .iter()
            .map(|(set, member)| {
                TxnOp::get(
                    self.set_key(set, member),
                    Some(GetOptions::new().with_count_only()),
                )
            })
            .collect();

        // A guard-less transaction is a single consistent read of every key.
        let resp = self.cli().await.txn(Txn::new().and_then(ops)).await?;

        let mut flags = Vec::with_capacity(probes.len());
        for op in resp.op_responses() {
            match op {
                TxnOpResponse::Get(get) => flags.push(get.count() > 0),
                other => {
                    return Err(StoreError::Protocol(format!(
                        "expected a range response, got {other:?}"
                    )));
                }
            }
        }
        if flags.len() != probes.len() {
            return Err(StoreError::Protocol(format!(
                "asked for {} memberships, got {}",
                probes.len(),
                flags.len()
            )));
        }
        Ok(flags)
    }
}
