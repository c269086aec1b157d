use async_trait::async_trait;
use reqwest::RequestBuilder;
use tokio::sync::RwLock;

/// Source of the bearer credential. Controllers ask for it at the moment of
/// every network call and never keep a copy.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn bearer_token(&self) -> Option<String>;
}

pub struct NoCredentials;

#[async_trait]
impl CredentialProvider for NoCredentials {
    async fn bearer_token(&self) -> Option<String> {
        None
    }
}

pub struct StaticToken(pub String);

#[async_trait]
impl CredentialProvider for StaticToken {
    async fn bearer_token(&self) -> Option<String> {
        Some(self.0.clone())
    }
}

/// A token cell that an external refresher can update while controllers run.
#[derive(Default)]
pub struct SharedToken {
    token: RwLock<Option<String>>,
}

impl SharedToken {
    pub fn new(token: Option<String>) -> Self {
        Self {
            token: RwLock::new(token),
        }
    }

    pub async fn set(&self, token: impl Into<String>) {
        *self.token.write().await = Some(token.into());
    }

    pub async fn clear(&self) {
        *self.token.write().await = None;
    }
}

#[async_trait]
impl CredentialProvider for SharedToken {
    async fn bearer_token(&self) -> Option<String> {
        self.token.read().await.clone()
    }
}

pub(crate) async fn authorize(
    builder: RequestBuilder,
    headers: &[(String, String)],
    credentials: &dyn CredentialProvider,
) -> RequestBuilder {
    let mut builder = headers
        .iter()
        .fold(builder, |builder, (name, value)| builder.header(name, value));
    if let Some(token) = credentials.bearer_token().await {
        builder = builder.bearer_auth(token);
    }
    builder
}
