//! Proxy registration and routing pushes.
//!
//! Proxies self-describe: `create_proxy` fetches the model from the admin
//! endpoint and registers it under the proxy-generated token, so retrying a
//! create is naturally idempotent. Routing pushes are strict, a push only
//! succeeds when every registered proxy acknowledged it; anything less and
//! the caller must assume routing is split.

use futures_util::future::join_all;
use shardhelm_core::{Proxy, SlotView};
use tracing::{info, warn};

use super::core::Coordinator;
use crate::error::{Conflict, CoordError};

impl Coordinator {
    // -----------------------------------------------------------------------
    // Routing pushes
    // -----------------------------------------------------------------------

    /// Push resolved routing state to every registered proxy.
    ///
    /// `sids` limits the push to those slots; `None` pushes the full table.
    /// Views are resolved against the cached snapshot, so callers mutate
    /// first and push after.
    ///
    /// # Errors
    ///
    /// `Unreachable` when any proxy rejects the push, naming every proxy
    /// that failed. The rest have already applied the new views.
    pub(crate) async fn push_slot_views(
        &self,
        sids: Option<&[usize]>,
    ) -> Result<(), CoordError> {
        if let Some(sids) = sids {
            if sids.is_empty() {
                return Ok(());
            }
        }
        let snapshot = self.cached();
        let proxies: Vec<Proxy> = snapshot.topology.proxies.values().cloned().collect();
        if proxies.is_empty() {
            return Ok(());
        }

        let views: Vec<SlotView> = match sids {
            Some(sids) => sids
                .iter()
                .filter_map(|&sid| snapshot.topology.slots.get(sid))
                .map(|slot| snapshot.topology.slot_view(slot))
                .collect(),
            None => snapshot.topology.slot_views(),
        };

        let pushes = proxies.iter().map(|proxy| {
            let views = &views;
            async move {
                self.proxy_admin()
                    .fill_slots(proxy, views)
                    .await
                    .map_err(|err| (proxy.admin_addr.clone(), err))
            }
        });
        let mut failed = Vec::new();
        let mut detail = String::new();
        for outcome in join_all(pushes).await {
            if let Err((addr, err)) = outcome {
                warn!(proxy = %addr, %err, "routing push rejected");
                if detail.is_empty() {
                    detail = err.to_string();
                }
                failed.push(addr);
            }
        }
        if failed.is_empty() {
            Ok(())
        } else {
            Err(CoordError::Unreachable {
                target: failed.join(", "),
                detail,
            })
        }
    }

    async fn fill_and_start(&self, proxy: &Proxy) -> Result<(), CoordError> {
        let views = self.cached().topology.slot_views();
        self.proxy_admin()
            .fill_slots(proxy, &views)
            .await
            .map_err(|err| CoordError::unreachable(&proxy.admin_addr, err))?;
        self.proxy_admin()
            .start(proxy)
            .await
            .map_err(|err| CoordError::unreachable(&proxy.admin_addr, err))?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Registration
    // -----------------------------------------------------------------------

    /// Register the proxy reachable at `admin_addr`, then bring it online.
    ///
    /// Registration keys on the proxy's own token, so creating the same
    /// instance twice conflicts instead of double-registering.
    pub async fn create_proxy(&self, admin_addr: &str) -> Result<(), CoordError> {
        if !shardhelm_core::auth::valid_addr(admin_addr) {
            return Err(CoordError::validation(format!(
                "invalid proxy address {admin_addr:?}"
            )));
        }
        let model = self
            .proxy_admin()
            .model(admin_addr)
            .await
            .map_err(|err| CoordError::unreachable(admin_addr, err))?;

        let registered = self
            .mutate(|topology| {
                if topology.proxies.contains_key(&model.token) {
                    return Err(Conflict::AlreadyExists {
                        resource: format!("proxy {}", model.token),
                    }
                    .into());
                }
                topology.proxy_seq += 1;
                let mut proxy = model.clone();
                proxy.id = topology.proxy_seq;
                topology.proxies.insert(proxy.token.clone(), proxy.clone());
                Ok(proxy)
            })
            .await?;
        info!(proxy = %registered.token, id = registered.id, addr = admin_addr, "proxy registered");

        // Registration sticks even if the bring-up below fails; the
        // operator retries with online/reinit once the proxy answers.
        self.fill_and_start(&registered).await
    }

    /// Re-push the full table to a registered proxy and start it.
    pub async fn online_proxy(&self, admin_addr: &str) -> Result<(), CoordError> {
        let snapshot = self.refresh().await?;
        let Some(proxy) = snapshot
            .topology
            .proxies
            .values()
            .find(|proxy| proxy.admin_addr == admin_addr)
            .cloned()
        else {
            return Err(CoordError::validation(format!(
                "no proxy registered at {admin_addr}"
            )));
        };
        self.fill_and_start(&proxy).await
    }

    /// Like [`Coordinator::online_proxy`], addressed by token.
    pub async fn reinit_proxy(&self, token: &str) -> Result<(), CoordError> {
        let snapshot = self.refresh().await?;
        let Some(proxy) = snapshot.topology.proxies.get(token).cloned() else {
            return Err(CoordError::validation(format!(
                "proxy {token} is not registered"
            )));
        };
        self.fill_and_start(&proxy).await
    }

    /// Deregister a proxy, shutting it down first.
    ///
    /// `force` skips the shutdown handshake so a crashed proxy can still be
    /// removed from the table.
    pub async fn remove_proxy(&self, token: &str, force: bool) -> Result<(), CoordError> {
        let snapshot = self.refresh().await?;
        let Some(proxy) = snapshot.topology.proxies.get(token).cloned() else {
            return Err(CoordError::validation(format!(
                "proxy {token} is not registered"
            )));
        };

        if let Err(err) = self.proxy_admin().shutdown(&proxy).await {
            if !force {
                return Err(CoordError::unreachable(&proxy.admin_addr, err));
            }
            warn!(proxy = token, %err, "shutdown skipped, removing anyway");
        }

        let token_owned = token.to_string();
        self.mutate(move |topology| {
            topology.proxies.remove(&token_owned);
            Ok(())
        })
        .await?;
        info!(proxy = token, addr = %proxy.admin_addr, "proxy removed");
        Ok(())
    }
}
