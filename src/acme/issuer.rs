//! Certificate issuers: the ACME client and the HTTP-01 challenge table
//!
//! [`AcmeIssuer`] orders one certificate per hostname and proves control of
//! it with the HTTP-01 challenge, answered by the plaintext listener from
//! [`Http01Challenges`].

use async_trait::async_trait;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, LetsEncrypt,
    NewAccount, NewOrder, Order, OrderStatus,
};
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, PKCS_ECDSA_P256_SHA256};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OnceCell, RwLock};
use tracing::{debug, info};

/// Path prefix of HTTP-01 validation requests
pub const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

/// Poll interval and attempts while waiting on the ACME server
const POLL_INTERVAL: Duration = Duration::from_secs(2);
const MAX_POLL_ATTEMPTS: u32 = 30;

/// PEM output of a successful issuance
#[derive(Debug, Clone)]
pub struct IssuedCertificate {
    pub cert_chain_pem: String,
    pub private_key_pem: String,
}

/// Something that can obtain a certificate for a hostname
#[async_trait]
pub trait CertificateIssuer: Send + Sync {
    async fn issue(&self, hostname: &str) -> anyhow::Result<IssuedCertificate>;
}

/// Pending ACME challenges for HTTP-01 validation
#[derive(Clone, Default)]
pub struct Http01Challenges {
    inner: Arc<RwLock<HashMap<String, String>>>,
}

impl Http01Challenges {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set(&self, token: String, key_authorization: String) {
        self.inner.write().await.insert(token, key_authorization);
    }

    pub async fn get(&self, token: &str) -> Option<String> {
        self.inner.read().await.get(token).cloned()
    }

    pub async fn remove(&self, token: &str) {
        self.inner.write().await.remove(token);
    }

    /// Key authorization for a request path under [`ACME_CHALLENGE_PREFIX`]
    pub async fn respond(&self, path: &str) -> Option<String> {
        let token = path.strip_prefix(ACME_CHALLENGE_PREFIX)?;
        self.get(token).await
    }
}

/// Issues certificates from an ACME directory (Let's Encrypt by default)
pub struct AcmeIssuer {
    email: Option<String>,
    directory_url: String,
    account_path: PathBuf,
    challenges: Http01Challenges,
    account: OnceCell<Account>,
}

impl AcmeIssuer {
    pub fn new(
        email: Option<String>,
        directory_url: Option<String>,
        cache_dir: PathBuf,
        challenges: Http01Challenges,
    ) -> Self {
        Self {
            email,
            directory_url: directory_url.unwrap_or_else(|| LetsEncrypt::Production.url().to_string()),
            account_path: cache_dir.join("account.json"),
            challenges,
            account: OnceCell::new(),
        }
    }

    pub fn challenges(&self) -> Http01Challenges {
        self.challenges.clone()
    }

    async fn account(&self) -> anyhow::Result<&Account> {
        self.account.get_or_try_init(|| self.load_or_create_account()).await
    }

    /// Load or create an ACME account
    async fn load_or_create_account(&self) -> anyhow::Result<Account> {
        if self.account_path.exists() {
            debug!(path = %self.account_path.display(), "Loading existing ACME account");
            let data = tokio::fs::read_to_string(&self.account_path).await?;
            let credentials: AccountCredentials = serde_json::from_str(&data)?;
            return Ok(Account::from_credentials(credentials).await?);
        }

        info!(directory = %self.directory_url, "Creating new ACME account");
        let email = self
            .email
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("ACME email is required for account creation"))?;

        let (account, credentials) = Account::create(
            &NewAccount {
                contact: &[&format!("mailto:{}", email)],
                terms_of_service_agreed: true,
                only_return_existing: false,
            },
            &self.directory_url,
            None,
        )
        .await?;

        if let Some(parent) = self.account_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let data = serde_json::to_string_pretty(&credentials)?;
        tokio::fs::write(&self.account_path, data).await?;
        info!(path = %self.account_path.display(), "ACME account credentials saved");

        Ok(account)
    }

    /// Publish the HTTP-01 answer for every pending authorization and wait
    /// for the server to validate it
    async fn authorize(&self, order: &mut Order, hostname: &str) -> anyhow::Result<()> {
        let authorizations = order.authorizations().await?;

        for authz in authorizations {
            if authz.status == AuthorizationStatus::Valid {
                continue;
            }

            let challenge = authz
                .challenges
                .iter()
                .find(|c| c.r#type == ChallengeType::Http01)
                .ok_or_else(|| anyhow::anyhow!("HTTP-01 challenge not offered for {}", hostname))?;

            let key_auth = order.key_authorization(challenge).as_str().to_string();
            debug!(hostname = %hostname, token = %challenge.token, "Publishing HTTP-01 challenge");
            self.challenges.set(challenge.token.clone(), key_auth).await;

            let result = async {
                order.set_challenge_ready(&challenge.url).await?;
                wait_for_authorization(order, hostname).await
            }
            .await;

            self.challenges.remove(&challenge.token).await;
            result?;
        }

        Ok(())
    }
}

async fn wait_for_authorization(order: &mut Order, hostname: &str) -> anyhow::Result<()> {
    for attempt in 1..=MAX_POLL_ATTEMPTS {
        tokio::time::sleep(POLL_INTERVAL).await;

        order.refresh().await?;
        let authorizations = order.authorizations().await?;
        let status = authorizations
            .iter()
            .find(|a| matches!(&a.identifier, Identifier::Dns(d) if d == hostname))
            .map(|a| &a.status);

        match status {
            Some(AuthorizationStatus::Valid) => {
                info!(hostname = %hostname, "Authorization valid");
                return Ok(());
            }
            Some(AuthorizationStatus::Invalid) => {
                anyhow::bail!("Authorization failed for {}", hostname);
            }
            Some(status) => {
                debug!(hostname = %hostname, attempt, ?status, "Waiting for authorization");
            }
            None => {
                anyhow::bail!("Authorization not found for {}", hostname);
            }
        }
    }
    anyhow::bail!("Authorization timeout for {}", hostname)
}

async fn wait_for_order_ready(order: &mut Order) -> anyhow::Result<()> {
    for _ in 0..MAX_POLL_ATTEMPTS {
        match order.state().status {
            OrderStatus::Ready | OrderStatus::Valid => return Ok(()),
            OrderStatus::Invalid => anyhow::bail!("Order invalid"),
            OrderStatus::Pending | OrderStatus::Processing => {
                tokio::time::sleep(POLL_INTERVAL).await;
                order.refresh().await?;
            }
        }
    }
    anyhow::bail!("Order timeout")
}

async fn wait_for_certificate(order: &mut Order) -> anyhow::Result<String> {
    for _ in 0..MAX_POLL_ATTEMPTS {
        order.refresh().await?;
        match order.state().status {
            OrderStatus::Valid => {
                return order
                    .certificate()
                    .await?
                    .ok_or_else(|| anyhow::anyhow!("Order valid but no certificate returned"));
            }
            OrderStatus::Processing => tokio::time::sleep(POLL_INTERVAL).await,
            ref status => anyhow::bail!("Unexpected order status: {:?}", status),
        }
    }
    anyhow::bail!("Certificate timeout")
}

#[async_trait]
impl CertificateIssuer for AcmeIssuer {
    async fn issue(&self, hostname: &str) -> anyhow::Result<IssuedCertificate> {
        let account = self.account().await?;
        info!(hostname = %hostname, "Requesting new certificate");

        let identifiers = [Identifier::Dns(hostname.to_string())];
        let mut order = account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await?;

        self.authorize(&mut order, hostname).await?;
        wait_for_order_ready(&mut order).await?;

        let mut params = CertificateParams::new(vec![hostname.to_string()])?;
        params.distinguished_name = DistinguishedName::new();
        params
            .distinguished_name
            .push(DnType::CommonName, hostname.to_string());

        let private_key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?;
        let csr = params.serialize_request(&private_key)?;
        order.finalize(csr.der()).await?;

        let cert_chain_pem = wait_for_certificate(&mut order).await?;
        info!(hostname = %hostname, "Certificate obtained successfully");

        Ok(IssuedCertificate {
            cert_chain_pem,
            private_key_pem: private_key.serialize_pem(),
        })
    }
}
