//! Resource registry
//!
//! This module provides the registry that manages resources and templates for
//! the default `listResources`, `readResource` and `listResourceTemplates`
//! handlers. Content comes from [`ResourceReader`] implementations, the
//! pluggable read interface for an external resource cache.

use async_trait::async_trait;
use bytes::Bytes;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{ debug, info };

use crate::errors::Error;
use crate::types::resources::guess_mime_type;
use crate::types::{
    ListResourceTemplatesResult,
    ListResourcesResult,
    Resource,
    ResourceContent,
    ResourceTemplate,
};

/// Reads the content behind a URI
#[async_trait]
pub trait ResourceReader: Send + Sync + 'static {
    async fn read(&self, uri: &str) -> Result<ResourceContent, Error>;
}

#[async_trait]
impl<R: ResourceReader + ?Sized> ResourceReader for Arc<R> {
    async fn read(&self, uri: &str) -> Result<ResourceContent, Error> {
        (**self).read(uri).await
    }
}

/// Fixed in-memory content
pub struct MemoryResource {
    mime_type: Option<String>,
    content: Bytes,
}

impl MemoryResource {
    pub fn new(content: impl Into<Bytes>) -> Self {
        Self {
            mime_type: None,
            content: content.into(),
        }
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }
}

#[async_trait]
impl ResourceReader for MemoryResource {
    async fn read(&self, uri: &str) -> Result<ResourceContent, Error> {
        let mime_type = self.mime_type.clone().unwrap_or_else(|| guess_mime_type(uri));
        Ok(ResourceContent::with_mime_type(uri, mime_type, self.content.clone()))
    }
}

/// Content read from a file on every request
pub struct FileResource {
    path: PathBuf,
}

impl FileResource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ResourceReader for FileResource {
    async fn read(&self, uri: &str) -> Result<ResourceContent, Error> {
        let bytes = tokio::fs::read(&self.path).await.map_err(|e| {
            match e.kind() {
                std::io::ErrorKind::NotFound => Error::NotFound(format!("Resource not found: {}", uri)),
                _ => Error::Io(e),
            }
        })?;
        let mime_type = mime_guess::from_path(&self.path)
            .first_raw()
            .map(str::to_string)
            .unwrap_or_else(|| guess_mime_type(uri));
        Ok(ResourceContent::with_mime_type(uri, mime_type, bytes))
    }
}

/// Literal prefix of a URI template, up to its first expression
fn template_prefix(template: &str) -> &str {
    template.split('{').next().unwrap_or(template)
}

/// Resource registry for managing resources
#[derive(Default)]
pub struct ResourceRegistry {
    /// Static resources in registration order
    resources: RwLock<Vec<(Resource, Arc<dyn ResourceReader>)>>,

    /// Resource templates in registration order
    templates: RwLock<Vec<(ResourceTemplate, Arc<dyn ResourceReader>)>>,

    /// Reader consulted for URIs nothing else matches
    fallback: RwLock<Option<Arc<dyn ResourceReader>>>,
}

impl ResourceRegistry {
    /// Create a new resource registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a resource with its reader; URIs are unique
    pub async fn register_resource<R>(&self, resource: Resource, reader: R) -> Result<(), Error>
        where R: ResourceReader
    {
        let mut resources = self.resources.write().await;
        if resources.iter().any(|(r, _)| r.uri == resource.uri) {
            return Err(Error::Conflict(format!("Resource already exists: {}", resource.uri)));
        }
        info!(uri = %resource.uri, "Registered resource");
        resources.push((resource, Arc::new(reader)));
        Ok(())
    }

    /// Register a template whose URIs are served by `reader`
    pub async fn register_template<R>(&self, template: ResourceTemplate, reader: R) -> Result<(), Error>
        where R: ResourceReader
    {
        let mut templates = self.templates.write().await;
        if templates.iter().any(|(t, _)| t.uri_template == template.uri_template) {
            return Err(
                Error::Conflict(format!("Resource template already exists: {}", template.uri_template))
            );
        }
        info!(template = %template.uri_template, "Registered resource template");
        templates.push((template, Arc::new(reader)));
        Ok(())
    }

    /// Set the reader for URIs that match no resource or template. On a
    /// running server use [`Server::set_fallback_reader`](crate::server::Server::set_fallback_reader),
    /// which also installs the resource handlers.
    pub async fn set_fallback_reader<R>(&self, reader: R) where R: ResourceReader {
        *self.fallback.write().await = Some(Arc::new(reader));
    }

    pub async fn is_empty(&self) -> bool {
        self.resources.read().await.is_empty() &&
            self.templates.read().await.is_empty() &&
            self.fallback.read().await.is_none()
    }

    /// All resources, for `listResources`
    pub async fn list(&self) -> ListResourcesResult {
        let resources = self.resources.read().await;
        ListResourcesResult {
            resources: resources
                .iter()
                .map(|(r, _)| r.clone())
                .collect(),
        }
    }

    /// All templates, for `listResourceTemplates`
    pub async fn list_templates(&self) -> ListResourceTemplatesResult {
        let templates = self.templates.read().await;
        ListResourceTemplatesResult {
            resource_templates: templates
                .iter()
                .map(|(t, _)| t.clone())
                .collect(),
        }
    }

    /// Read a resource, for `readResource`
    pub async fn read(&self, uri: &str) -> Result<ResourceContent, Error> {
        let (reader, declared_mime) = self.find_reader(uri).await?;
        debug!(uri, "Reading resource");
        let mut content = reader.read(uri).await?;
        if let Some(mime_type) = declared_mime {
            content.mime_type = mime_type;
        }
        Ok(content)
    }

    async fn find_reader(&self, uri: &str) -> Result<(Arc<dyn ResourceReader>, Option<String>), Error> {
        if
            let Some((resource, reader)) = self.resources
                .read().await
                .iter()
                .find(|(r, _)| r.uri == uri)
        {
            return Ok((reader.clone(), resource.mime_type.clone()));
        }

        // Longest literal prefix wins among matching templates
        if
            let Some((template, reader)) = self.templates
                .read().await
                .iter()
                .filter(|(t, _)| uri.starts_with(template_prefix(&t.uri_template)))
                .max_by_key(|(t, _)| template_prefix(&t.uri_template).len())
        {
            return Ok((reader.clone(), template.mime_type.clone()));
        }

        match self.fallback.read().await.as_ref() {
            Some(reader) => Ok((reader.clone(), None)),
            None => Err(Error::NotFound(format!("Resource not found: {}", uri))),
        }
    }
}
