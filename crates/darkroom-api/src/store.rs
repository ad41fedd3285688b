//! Typed store the API handlers talk to
//!
//! List and get are served from the reflector cache; create and delete go to
//! the API server so admission runs on every write.

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, PostParams};
use kube::runtime::reflector::ObjectRef;
use kube::{Client, ResourceExt};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use darkroom_common::crd::Darkroom;
use darkroom_common::{Error, API_SERVER_FIELD_MANAGER};

use crate::cache::CacheReader;

const PLURAL: &str = "darkrooms";

/// CRUD verbs over Darkroom resources
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DarkroomStore: Send + Sync {
    /// All Darkrooms in `namespace`
    async fn list(&self, namespace: &str) -> Result<Vec<Darkroom>, Error>;

    /// One Darkroom, or `Error::NotFound`
    async fn get(&self, namespace: &str, name: &str) -> Result<Darkroom, Error>;

    /// Create `darkroom` in its own namespace and return the stored object
    async fn create(&self, darkroom: &Darkroom) -> Result<Darkroom, Error>;

    /// Delete a Darkroom; its children follow through garbage collection
    async fn delete(&self, namespace: &str, name: &str) -> Result<(), Error>;
}

/// Store backed by a reflector cache and the Kubernetes API
pub struct KubeStore {
    client: Client,
    cache: CacheReader,
}

impl KubeStore {
    /// Create a store reading from `cache` and writing through `client`
    pub fn new(client: Client, cache: CacheReader) -> Self {
        Self { client, cache }
    }
}

#[async_trait]
impl DarkroomStore for KubeStore {
    async fn list(&self, namespace: &str) -> Result<Vec<Darkroom>, Error> {
        let mut items: Vec<Darkroom> = self
            .cache
            .snapshot()
            .await
            .state()
            .into_iter()
            .filter(|d| d.namespace().as_deref() == Some(namespace))
            .map(|d| (*d).clone())
            .collect();
        items.sort_by_key(|d| d.name_any());
        Ok(items)
    }

    async fn get(&self, namespace: &str, name: &str) -> Result<Darkroom, Error> {
        self.cache
            .snapshot()
            .await
            .get(&ObjectRef::new(name).within(namespace))
            .map(|d| (*d).clone())
            .ok_or_else(|| Error::not_found(PLURAL, namespace, name))
    }

    async fn create(&self, darkroom: &Darkroom) -> Result<Darkroom, Error> {
        let namespace = darkroom.namespace().unwrap_or_default();
        let api: Api<Darkroom> = Api::namespaced(self.client.clone(), &namespace);
        let params = PostParams {
            field_manager: Some(API_SERVER_FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        let created = api.create(&params, darkroom).await?;
        debug!(name = %created.name_any(), namespace = %namespace, "created darkroom");
        Ok(created)
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), Error> {
        // Same lookup as `get` so a missing object yields the same 404.
        self.get(namespace, name).await?;
        let api: Api<Darkroom> = Api::namespaced(self.client.clone(), namespace);
        api.delete(name, &DeleteParams::default()).await?;
        debug!(name = %name, namespace = %namespace, "deleted darkroom");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use axum::http::{Request, Response};
    use kube::runtime::reflector;
    use kube::runtime::watcher::Event;

    use darkroom_common::crd::{DarkroomSpec, Source, WebFolderSource};

    use super::*;

    // =========================================================================
    // Test Fixtures
    // =========================================================================

    fn darkroom(namespace: &str, name: &str) -> Darkroom {
        let mut darkroom = Darkroom::new(
            name,
            DarkroomSpec {
                version: "0.1.0".to_string(),
                source: Source::WebFolder(WebFolderSource {
                    base_url: "https://example.com".to_string(),
                }),
                path_prefix: None,
                domains: vec![format!("{name}.example.com")],
            },
        );
        darkroom.metadata.namespace = Some(namespace.to_string());
        darkroom
    }

    /// Client that fails every call; reads must never reach it
    fn offline_client() -> Client {
        let service = tower::service_fn(|_req: Request<kube::client::Body>| async {
            Err::<Response<axum::body::Body>, _>(std::io::Error::other("offline"))
        });
        Client::new(service, "default")
    }

    /// A store whose cache already holds `objects`
    fn store_with(objects: Vec<Darkroom>) -> KubeStore {
        let (reader, mut writer) = reflector::store();
        for obj in objects {
            writer.apply_watcher_event(&Event::Apply(obj));
        }
        KubeStore::new(offline_client(), CacheReader::new(reader))
    }

    fn names(items: &[Darkroom]) -> Vec<String> {
        items.iter().map(|d| d.name_any()).collect()
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Story: Listing a namespace returns only its Darkrooms, sorted by name
    #[tokio::test]
    async fn story_list_filters_namespace_and_sorts_by_name() {
        let store = store_with(vec![
            darkroom("default", "zebra"),
            darkroom("other", "alpha"),
            darkroom("default", "gallery"),
            darkroom("default", "avatars"),
        ]);

        let items = store.list("default").await.unwrap();
        assert_eq!(names(&items), vec!["avatars", "gallery", "zebra"]);

        let items = store.list("other").await.unwrap();
        assert_eq!(names(&items), vec!["alpha"]);
    }

    #[tokio::test]
    async fn list_of_empty_namespace_is_empty() {
        let store = store_with(vec![darkroom("default", "gallery")]);
        assert!(store.list("missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn get_returns_cached_object() {
        let store = store_with(vec![darkroom("default", "gallery"), darkroom("other", "gallery")]);

        let found = store.get("other", "gallery").await.unwrap();
        assert_eq!(found.namespace().as_deref(), Some("other"));
        assert_eq!(found.name_any(), "gallery");
    }

    /// Story: A name that exists only in another namespace is not found
    #[tokio::test]
    async fn story_get_missing_is_not_found() {
        let store = store_with(vec![darkroom("other", "gallery")]);

        let err = store.get("default", "gallery").await.unwrap_err();
        assert!(matches!(
            err,
            Error::NotFound { ref kind, ref namespace, ref name }
                if kind == PLURAL && namespace == "default" && name == "gallery"
        ));
    }

    /// Story: Deleting a missing Darkroom answers not found without calling the API
    #[tokio::test]
    async fn story_delete_missing_is_not_found() {
        let store = store_with(vec![]);

        let err = store.delete("default", "gallery").await.unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }
}
