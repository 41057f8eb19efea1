//! Actor provisioning
//!
//! Creates configured local actors at startup: the actor document, its
//! four collections, and a private credentials resource holding the
//! signing key.

use serde_json::{Value, json};

use crate::auth::hash_token;
use crate::config::ActorBootstrap;
use crate::data::model::{
    CREDENTIALS_TYPE, PRIVATE_KEY_PROPERTY, ROLE_PROPERTY, TOKEN_HASH_PROPERTY,
};
use crate::data::{Predicate, ResourceStore};
use crate::error::AppError;

const COLLECTIONS: [&str; 4] = ["inbox", "outbox", "followers", "following"];

async fn generate_keypair(bits: usize) -> Result<(String, String), AppError> {
    tokio::task::spawn_blocking(move || -> Result<(String, String), anyhow::Error> {
        use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
        use rsa::{RsaPrivateKey, RsaPublicKey};

        let mut rng = rand::thread_rng();
        let private_key = RsaPrivateKey::new(&mut rng, bits)?;
        let public_key = RsaPublicKey::from(&private_key);
        let private_key_pem = private_key.to_pkcs8_pem(LineEnding::LF)?.to_string();
        let public_key_pem = public_key.to_public_key_pem(LineEnding::LF)?;
        Ok((private_key_pem, public_key_pem))
    })
    .await
    .map_err(|e| AppError::Internal(e.into()))?
    .map_err(AppError::Internal)
}

fn actor_document(actor: &ActorBootstrap, public_key_pem: &str, host: &str) -> Value {
    let uri = &actor.uri;
    let mut document = json!({
        "@context": [
            "https://www.w3.org/ns/activitystreams",
            "https://w3id.org/security/v1"
        ],
        "id": uri,
        "type": "Person",
        "name": actor.name,
        "preferredUsername": actor.handle,
        "alsoKnownAs": [format!("acct:{}@{}", actor.handle, host)],
        "publicKey": {
            "id": format!("{}#main-key", uri),
            "owner": uri,
            "publicKeyPem": public_key_pem
        }
    });
    for collection in COLLECTIONS {
        document[collection] = json!(format!("{}/{}", uri, collection));
    }
    if let Some(summary) = &actor.summary {
        document["summary"] = json!(summary);
    }
    document
}

fn credentials_document(actor: &ActorBootstrap, private_key_pem: &str) -> Value {
    let mut credentials = json!({
        "id": format!("urn:uuid:{}", ulid::Ulid::new().to_string().to_lowercase()),
        "type": CREDENTIALS_TYPE,
        "attributedTo": actor.uri,
        PRIVATE_KEY_PROPERTY: private_key_pem,
        ROLE_PROPERTY: actor.roles,
    });
    if let Some(token) = &actor.token {
        credentials[TOKEN_HASH_PROPERTY] = json!(hash_token(token));
    }
    credentials
}

/// Make sure the configured actor exists
///
/// Returns `true` when the actor was created. For an existing actor only
/// the roles and token hash of its credentials are brought up to date.
pub async fn ensure_actor(
    store: &dyn ResourceStore,
    actor: &ActorBootstrap,
    key_bits: usize,
) -> Result<bool, AppError> {
    let host = url::Url::parse(&actor.uri)
        .ok()
        .and_then(|url| url.host_str().map(str::to_string))
        .ok_or_else(|| AppError::Config(format!("actor uri {} has no host", actor.uri)))?;

    if store.is_stored(&actor.uri).await? {
        let predicate = Predicate::private()
            .with_type(CREDENTIALS_TYPE)
            .attributed_to(actor.uri.as_str());
        if let Some(mut credentials) = store.query_one(&predicate).await? {
            let roles = json!(actor.roles);
            let token_hash = actor.token.as_deref().map(hash_token).map(Value::String);
            let outdated = credentials.get(ROLE_PROPERTY) != Some(&roles)
                || credentials.get(TOKEN_HASH_PROPERTY) != token_hash.as_ref();
            if outdated {
                if let Some(fields) = credentials.as_object_mut() {
                    fields.insert(ROLE_PROPERTY.to_string(), roles);
                    match token_hash {
                        Some(hash) => fields.insert(TOKEN_HASH_PROPERTY.to_string(), hash),
                        None => fields.remove(TOKEN_HASH_PROPERTY),
                    };
                }
                store.put(credentials).await?;
                tracing::info!(actor = %actor.uri, "Actor credentials updated");
            } else {
                tracing::info!(actor = %actor.uri, "Actor exists");
            }
        } else {
            tracing::warn!(actor = %actor.uri, "Actor exists without credentials; it cannot sign deliveries");
        }
        return Ok(false);
    }

    tracing::info!(actor = %actor.uri, bits = key_bits, "Creating actor...");
    let (private_key_pem, public_key_pem) = generate_keypair(key_bits).await?;

    for collection in COLLECTIONS {
        store
            .put(json!({
                "id": format!("{}/{}", actor.uri, collection),
                "type": "OrderedCollection",
                "attributedTo": actor.uri,
                "totalItems": 0,
                "orderedItems": []
            }))
            .await?;
    }
    store.put(credentials_document(actor, &private_key_pem)).await?;
    store.put(actor_document(actor, &public_key_pem, &host)).await?;

    tracing::info!(actor = %actor.uri, handle = %actor.handle, "Actor created");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::MemoryResourceStore;
    use crate::data::model::Actor;

    fn bootstrap(token: Option<&str>) -> ActorBootstrap {
        ActorBootstrap {
            uri: "https://social.example/actor/alice".to_string(),
            name: "Alice".to_string(),
            handle: "alice".to_string(),
            summary: Some("Hello".to_string()),
            roles: vec!["admin".to_string()],
            token: token.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn creates_actor_collections_and_credentials() {
        let store = MemoryResourceStore::new();
        assert!(ensure_actor(&store, &bootstrap(Some("s3cret")), 1024).await.unwrap());

        let document = store
            .get("https://social.example/actor/alice")
            .await
            .unwrap()
            .unwrap();
        let actor = Actor::from_value(&document).unwrap();
        assert_eq!(actor.key_id(), Some("https://social.example/actor/alice#main-key"));
        assert!(actor.public_key_pem().unwrap().contains("BEGIN PUBLIC KEY"));
        assert_eq!(document["alsoKnownAs"][0], "acct:alice@social.example");

        let inbox = store
            .get("https://social.example/actor/alice/inbox")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(inbox["orderedItems"], json!([]));

        let credentials = store
            .query_one(
                &Predicate::private()
                    .with_type(CREDENTIALS_TYPE)
                    .attributed_to("https://social.example/actor/alice"),
            )
            .await
            .unwrap()
            .unwrap();
        assert!(credentials[PRIVATE_KEY_PROPERTY].as_str().unwrap().contains("PRIVATE KEY"));
        assert_eq!(credentials[TOKEN_HASH_PROPERTY], hash_token("s3cret"));
        assert_eq!(credentials[ROLE_PROPERTY], json!(["admin"]));
    }

    #[tokio::test]
    async fn existing_actor_only_refreshes_credentials() {
        let store = MemoryResourceStore::new();
        ensure_actor(&store, &bootstrap(Some("old")), 1024).await.unwrap();
        let before = store.len().await;

        assert!(!ensure_actor(&store, &bootstrap(Some("new")), 1024).await.unwrap());
        assert_eq!(store.len().await, before);

        let credentials = store
            .query_one(&Predicate::private().with_type(CREDENTIALS_TYPE))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(credentials[TOKEN_HASH_PROPERTY], hash_token("new"));
    }
}
