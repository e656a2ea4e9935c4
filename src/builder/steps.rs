use std::fs;
use std::io;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread;
use std::thread::ScopedJoinHandle;

use anyhow::{anyhow, Context, Result};
use log::{debug, info};
use tempfile::{NamedTempFile, TempDir};
use ubyte::ByteUnit;

use crate::blob::digest::{BlobDescriptor, DescriptorDigest};
use crate::blob::digests::compute_digest_of_bytes;
use crate::blob::Blob;
use crate::builder::containerizer::{Containerizer, FibContainer, ImageTarget};
use crate::builder::plan::{FibContainerBuilder, FileEntriesLayer};
use crate::cache::{generate_selector, Cache, CacheCorruptedError, CachedLayer};
use crate::credential::{retrieve_first, Credential, CredentialRetrieverFactory};
use crate::docker::tarball::docker_name;
use crate::docker::{DockerClient, ImageTarball, TarballLayer};
use crate::event::progress::{ChildProgressEventDispatcherFactory, ProgressEventDispatcher};
use crate::event::timer::TimerEventDispatcher;
use crate::event::{EventHandlers, LogEvent};
use crate::http::ByteCountCallback;
use crate::image::json::{ImageToJsonTranslator, JsonToImageTranslator};
use crate::image::manifest::ManifestTemplate;
use crate::image::reference::ImageReference;
use crate::image::{HistoryEntry, Image, ImageLayer};
use crate::layer::reproducible::ReproducibleLayerBuilder;
use crate::registry::{RegistryClient, RegistryCreateInfo};

/// The base image once its manifest and configuration are known.
struct BaseImage {
    image: Image,
    layers: Vec<BlobDescriptor>,
    registry_client: Mutex<Option<Arc<RegistryClient>>>,
}

/// The assembled image with everything a sink needs.
struct BuiltImage {
    image: Image,
    layers: Vec<CachedLayer>,
    base_layer_count: usize,
    config_blob: Arc<Blob>,
    config_descriptor: BlobDescriptor,
    manifest: ManifestTemplate,
    manifest_digest: DescriptorDigest,
}

/// Runs one build. Base layers and application layers are obtained in
/// parallel; within each, every layer gets its own worker.
pub(crate) struct BuildSteps<'a> {
    builder: &'a FibContainerBuilder,
    containerizer: &'a Containerizer,
    base_layers_cache: Cache,
    application_layers_cache: Cache,
    event_handlers: EventHandlers,
}

pub(crate) fn containerize(builder: &FibContainerBuilder, containerizer: &Containerizer) -> Result<FibContainer> {
    let base_layers_cache = Cache::with_directory(&containerizer.base_image_layers_cache_directory()?)?;
    // Lives until the image is published, the sinks read layers from it.
    let mut _temporary_directory: Option<TempDir> = None;
    let application_layers_cache = match containerizer.application_layers_cache_directory() {
        Some(directory) => Cache::with_directory(directory)?,
        None => {
            let directory = tempfile::Builder::new()
                .prefix("fibpack-layers-")
                .tempdir()
                .context("failed to create a temporary application layers cache")?;
            let cache = Cache::with_directory(directory.path())?;
            _temporary_directory = Some(directory);
            cache
        }
    };
    let steps = BuildSteps {
        builder,
        containerizer,
        base_layers_cache,
        application_layers_cache,
        event_handlers: containerizer.event_handlers.clone(),
    };
    steps.run()
}

impl<'a> BuildSteps<'a> {
    fn run(&self) -> Result<FibContainer> {
        let description = format!("Building image to {}", self.containerizer.target);
        self.event_handlers.dispatch(LogEvent::lifecycle(format!("{}...", description)));
        let timer = TimerEventDispatcher::new(&self.event_handlers, description.as_str());
        let mut progress = ProgressEventDispatcher::new_root(&self.event_handlers, description.as_str(), 4);

        let base_image = self.pull_base_image(progress.new_child_producer(), &timer)?;
        let base_layers_progress = progress.new_child_producer();
        let application_layers_progress = progress.new_child_producer();
        let (base_layers, application_layers) = thread::scope(|scope| {
            let application_layers = scope.spawn(|| self.build_application_layers(application_layers_progress, &timer));
            let base_layers = self.obtain_base_layers(&base_image, base_layers_progress, &timer);
            (base_layers, join(application_layers))
        });
        let built = self.build_image(&base_image, base_layers?, application_layers?, &timer)?;

        let publish_progress = progress.new_child_producer();
        let image_digest = match &self.containerizer.target {
            ImageTarget::Registry { credential } => self.push_image(&built, credential.clone(), publish_progress, &timer)?,
            ImageTarget::Tar { path } => {
                self.write_tar(&built, path, publish_progress, &timer)?;
                built.manifest_digest.clone()
            }
            ImageTarget::DockerDaemon { client } => {
                self.load_docker(&built, client, publish_progress, &timer)?;
                built.manifest_digest.clone()
            }
        };

        let container = FibContainer {
            image_digest,
            image_id: built.config_descriptor.digest().clone(),
            target_image: self.containerizer.target_image.clone(),
            tags: self.containerizer.all_tags(),
        };
        self.event_handlers.dispatch(LogEvent::lifecycle(format!(
            "Built image {} with digest {}",
            container.target_image, container.image_digest
        )));
        Ok(container)
    }

    fn pull_base_image(&self, progress: ChildProgressEventDispatcherFactory, timer: &TimerEventDispatcher) -> Result<BaseImage> {
        let base_image = &self.builder.base_image;
        let _timer = timer.sub_timer("Pulling base image manifest");
        let _progress = progress.create(format!("pulling base image manifest for {}", base_image), 1);

        if base_image.is_scratch() {
            self.event_handlers.dispatch(LogEvent::info("Using scratch as the base image"));
            return Ok(BaseImage {
                image: Image::default(),
                layers: vec![],
                registry_client: Mutex::new(None),
            });
        }

        // A digest pins the manifest, so a cached copy is as good as a pulled one.
        if self.containerizer.offline || base_image.digest().is_some() {
            if let Some(metadata) = self.base_layers_cache.retrieve_metadata(base_image)? {
                self.event_handlers.dispatch(LogEvent::info(format!("Using cached base image manifest for {}", base_image)));
                return Ok(BaseImage {
                    image: JsonToImageTranslator::to_image(&metadata.manifest, metadata.config.as_ref())?,
                    layers: metadata.manifest.layers(),
                    registry_client: Mutex::new(None),
                });
            }
            if self.containerizer.offline {
                return Err(anyhow!("cannot run in offline mode: the base image {} is not in the cache", base_image));
            }
        }

        self.event_handlers.dispatch(LogEvent::progress(format!("Getting manifest for base image {}...", base_image)));
        let client = self.open_base_image_registry()?;
        let (manifest, digest) = client.pull_any_manifest(&base_image.qualifier())?;
        debug!("Base image {} has a {} manifest with digest {}", base_image, manifest.manifest_type(), digest);
        let config = match manifest.config() {
            Some(config) => Some(client.pull_config_blob(&config.digest)?),
            None => None,
        };
        self.base_layers_cache.write_metadata(base_image, &manifest, config.as_ref())?;
        Ok(BaseImage {
            image: JsonToImageTranslator::to_image(&manifest, config.as_ref())?,
            layers: manifest.layers(),
            registry_client: Mutex::new(Some(client)),
        })
    }

    fn open_base_image_registry(&self) -> Result<Arc<RegistryClient>> {
        let base_image = &self.builder.base_image;
        let credential = self.retrieve_credential(base_image, self.builder.base_image_credential.clone(), "the base image credential")?;
        self.open_registry(base_image, credential)
    }

    fn base_image_registry(&self, base_image: &BaseImage) -> Result<Arc<RegistryClient>> {
        let mut registry_client = base_image
            .registry_client
            .lock()
            .map_err(|_| anyhow!("base image registry client lock poisoned"))?;
        match registry_client.as_ref() {
            Some(client) => Ok(client.clone()),
            None => {
                let client = self.open_base_image_registry()?;
                *registry_client = Some(client.clone());
                Ok(client)
            }
        }
    }

    fn obtain_base_layers(
        &self,
        base_image: &BaseImage,
        progress: ChildProgressEventDispatcherFactory,
        timer: &TimerEventDispatcher,
    ) -> Result<Vec<CachedLayer>> {
        let _timer = timer.sub_timer("Obtaining base image layers");
        let mut progress = progress.create("obtaining base image layers", base_image.layers.len() as u64);
        thread::scope(|scope| {
            let handles = base_image
                .layers
                .iter()
                .map(|descriptor| {
                    let layer_progress = progress.new_child_producer();
                    scope.spawn(move || self.obtain_base_layer(base_image, descriptor, layer_progress))
                })
                .collect::<Vec<ScopedJoinHandle<Result<CachedLayer>>>>();
            handles.into_iter().map(join).collect::<Result<Vec<CachedLayer>>>()
        })
    }

    fn obtain_base_layer(
        &self,
        base_image: &BaseImage,
        descriptor: &BlobDescriptor,
        progress: ChildProgressEventDispatcherFactory,
    ) -> Result<CachedLayer> {
        let digest = descriptor.digest();
        if let Some(cached) = self.base_layers_cache.retrieve(digest)? {
            progress.create(format!("base image layer {} from cache", digest.short_hash()), 1);
            debug!("Base image layer {} found in the cache", digest.short_hash());
            return Ok(cached);
        }
        if self.containerizer.offline {
            return Err(anyhow!("cannot run in offline mode: base image layer {} is not in the cache", digest));
        }

        let client = self.base_image_registry(base_image)?;
        let units = if descriptor.size() > 0 { descriptor.size() as u64 } else { 1 };
        let progress = Arc::new(Mutex::new(progress.create(format!("pulling base image layer {}", digest.short_hash()), units)));
        let short_hash = digest.short_hash().to_string();
        let blob = client.pull_blob(
            digest,
            Arc::new(move |size| debug!("Pulling base image layer {} ({})", short_hash, ByteUnit::from(size))),
            progress_callback(&progress),
        );
        let cached = self.base_layers_cache.write_compressed_layer_checked(&blob, digest)?;
        info!("Pulled base image layer {} ({})", digest.short_hash(), ByteUnit::from(cached.size().max(0) as u64));
        Ok(cached)
    }

    fn build_application_layers(
        &self,
        progress: ChildProgressEventDispatcherFactory,
        timer: &TimerEventDispatcher,
    ) -> Result<Vec<(String, CachedLayer)>> {
        let _timer = timer.sub_timer("Building application layers");
        let layers = &self.builder.layers;
        let mut progress = progress.create("building application layers", layers.len() as u64);
        thread::scope(|scope| {
            let handles = layers
                .iter()
                .map(|layer| {
                    let layer_progress = progress.new_child_producer();
                    scope.spawn(move || self.build_application_layer(layer, layer_progress))
                })
                .collect::<Vec<ScopedJoinHandle<Result<(String, CachedLayer)>>>>();
            handles.into_iter().map(join).collect::<Result<Vec<(String, CachedLayer)>>>()
        })
    }

    fn build_application_layer(&self, layer: &FileEntriesLayer, progress: ChildProgressEventDispatcherFactory) -> Result<(String, CachedLayer)> {
        let _progress = progress.create(format!("building {} layer", layer.name()), 1);
        let selector = generate_selector(layer.entries())?;
        if let Some(cached) = self.application_layers_cache.retrieve_by_selector(&selector)? {
            debug!("Layer {} is unchanged, using cached {}", layer.name(), cached.digest().short_hash());
            return Ok((layer.name().to_string(), cached));
        }

        self.event_handlers.dispatch(LogEvent::progress(format!("Building {} layer...", layer.name())));
        let blob = ReproducibleLayerBuilder::new(layer.entries().to_vec())
            .build()
            .with_context(|| format!("failed to build the {} layer", layer.name()))?;
        let cached = self.application_layers_cache.write_uncompressed_layer(&blob, Some(&selector))?;
        debug!("Built {} layer {} ({})", layer.name(), cached.digest().short_hash(), ByteUnit::from(cached.size().max(0) as u64));
        Ok((layer.name().to_string(), cached))
    }

    fn build_image(
        &self,
        base_image: &BaseImage,
        base_layers: Vec<CachedLayer>,
        application_layers: Vec<(String, CachedLayer)>,
        timer: &TimerEventDispatcher,
    ) -> Result<BuiltImage> {
        let _timer = timer.sub_timer("Building container configuration");
        let builder = self.builder;
        let mut image = base_image.image.clone();

        // Schema 1 bases carry no diff ids, those come from the layers themselves.
        if !image.layers.is_empty() {
            for (expected, cached) in image.layers.iter().zip(base_layers.iter()) {
                if &expected.diff_id != cached.diff_id() {
                    return Err(CacheCorruptedError::new(
                        self.base_layers_cache.files().root(),
                        format!(
                            "base image layer {} has diff id {} but the base image configuration expects {}",
                            cached.digest(),
                            cached.diff_id(),
                            expected.diff_id
                        ),
                    )
                    .into());
                }
            }
        }

        let created = builder.creation_time_rfc3339();
        image.format = builder.format;
        image.created = Some(created.clone());
        image.layers = base_layers.iter().map(image_layer).collect();
        for (name, layer) in &application_layers {
            image.layers.push(image_layer(layer));
            image.history.push(HistoryEntry {
                created: Some(created.clone()),
                author: Some(self.containerizer.tool_name.clone()),
                created_by: Some(format!("{}:{}", self.containerizer.tool_name, env!("CARGO_PKG_VERSION"))),
                comment: Some(name.clone()),
                empty_layer: None,
            });
        }

        image.environment.extend(builder.environment.clone());
        if builder.entrypoint.is_some() {
            image.entrypoint = builder.entrypoint.clone();
            image.cmd = None;
        }
        if builder.program_arguments.is_some() {
            image.cmd = builder.program_arguments.clone();
        }
        image.exposed_ports.extend(builder.exposed_ports.iter().cloned());
        image.labels.extend(builder.labels.clone());
        image.volumes.extend(builder.volumes.iter().cloned());
        if builder.working_directory.is_some() {
            image.working_dir = builder.working_directory.clone();
        }
        if builder.user.is_some() {
            image.user = builder.user.clone();
        }

        let translator = ImageToJsonTranslator::new(&image);
        let config_blob = Arc::new(translator.container_configuration_blob()?);
        let config_descriptor = config_blob.write_to(&mut io::sink())?;
        let manifest = translator.manifest_template(&config_descriptor);
        let manifest_digest = compute_digest_of_bytes(&serde_json::to_vec(&manifest.to_json_value()?)?).digest().clone();

        let base_layer_count = base_layers.len();
        let mut layers = base_layers;
        layers.extend(application_layers.into_iter().map(|(_, layer)| layer));
        Ok(BuiltImage {
            image,
            layers,
            base_layer_count,
            config_blob,
            config_descriptor,
            manifest,
            manifest_digest,
        })
    }

    fn push_image(
        &self,
        built: &BuiltImage,
        credential: Option<Credential>,
        progress: ChildProgressEventDispatcherFactory,
        timer: &TimerEventDispatcher,
    ) -> Result<DescriptorDigest> {
        let target_image = &self.containerizer.target_image;
        let _timer = timer.sub_timer("Pushing image");
        let credential = self.retrieve_credential(target_image, credential, "the target image credential")?;
        let client = self.open_registry(target_image, credential)?;
        let tags = self.containerizer.all_tags();
        let mut progress = progress.create(format!("pushing image to {}", target_image), (built.layers.len() + 1 + tags.len()) as u64);

        let base_image = &self.builder.base_image;
        let mount_source = (!base_image.is_scratch()
            && base_image.registry() == target_image.registry()
            && base_image.repository() != target_image.repository())
        .then(|| base_image.repository());

        self.event_handlers.dispatch(LogEvent::progress(format!("Pushing {} layers to {}...", built.layers.len(), target_image)));
        thread::scope(|scope| {
            let handles = built
                .layers
                .iter()
                .enumerate()
                .map(|(index, layer)| {
                    let blob_progress = progress.new_child_producer();
                    let source = if index < built.base_layer_count { mount_source } else { None };
                    let client = &client;
                    scope.spawn(move || self.push_blob(client, layer.digest(), layer.blob().clone(), source, blob_progress))
                })
                .collect::<Vec<ScopedJoinHandle<Result<()>>>>();
            handles.into_iter().map(join).collect::<Result<Vec<()>>>()
        })?;
        self.push_blob(
            &client,
            built.config_descriptor.digest(),
            built.config_blob.clone(),
            None,
            progress.new_child_producer(),
        )?;

        let mut image_digest = built.manifest_digest.clone();
        for tag in &tags {
            let _progress = progress.new_child_producer().create(format!("pushing manifest for {}", tag), 1);
            image_digest = client.push_manifest(&built.manifest, tag)?;
            self.event_handlers.dispatch(LogEvent::info(format!("Tagged {} as {}", image_digest, target_image.with_tag(tag)?)));
        }
        Ok(image_digest)
    }

    fn push_blob(
        &self,
        client: &RegistryClient,
        digest: &DescriptorDigest,
        blob: Arc<Blob>,
        source_repository: Option<&str>,
        progress: ChildProgressEventDispatcherFactory,
    ) -> Result<()> {
        let units = if blob.size() > 0 { blob.size() as u64 } else { 1 };
        let progress = Arc::new(Mutex::new(progress.create(format!("pushing blob {}", digest.short_hash()), units)));
        if client.push_blob(digest, blob, source_repository, Some(progress_callback(&progress)))? {
            debug!("Skipped pushing blob {}, the registry already has it", digest.short_hash());
        } else {
            debug!("Pushed blob {}", digest.short_hash());
        }
        Ok(())
    }

    fn write_tar(&self, built: &BuiltImage, path: &Path, progress: ChildProgressEventDispatcherFactory, timer: &TimerEventDispatcher) -> Result<()> {
        let _timer = timer.sub_timer("Writing image tarball");
        let _progress = progress.create(format!("writing image tarball {}", path.display()), 1);
        let tarball = self.image_tarball(built, self.containerizer.additional_tags.iter().cloned().collect());

        let directory = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(directory).with_context(|| format!("failed to create directory {}", directory.display()))?;
        let temp_file = NamedTempFile::new_in(directory).with_context(|| format!("failed to create a temporary file in {}", directory.display()))?;
        {
            let mut writer = BufWriter::new(temp_file.as_file());
            tarball.write_to(&mut writer)?;
            writer.flush()?;
        }
        temp_file
            .persist(path)
            .with_context(|| format!("failed to move the image tarball to {}", path.display()))?;
        self.event_handlers.dispatch(LogEvent::info(format!("Wrote image tarball {}", path.display())));
        Ok(())
    }

    fn load_docker(
        &self,
        built: &BuiltImage,
        client: &DockerClient,
        progress: ChildProgressEventDispatcherFactory,
        timer: &TimerEventDispatcher,
    ) -> Result<()> {
        let _timer = timer.sub_timer("Loading image into Docker");
        let mut progress = progress.create("loading image into Docker", 1 + self.containerizer.additional_tags.len() as u64);
        let target_image = &self.containerizer.target_image;
        let tarball = self.image_tarball(built, vec![]);

        self.event_handlers.dispatch(LogEvent::progress(format!("Loading {} into Docker...", target_image)));
        let output = client.load(&tarball, None)?;
        self.event_handlers.dispatch(LogEvent::info(output));
        progress.dispatch_progress(1);

        let name = docker_name(target_image);
        let loaded = format!("{}:{}", name, target_image.tag().unwrap_or(crate::image::reference::DEFAULT_TAG));
        for tag in &self.containerizer.additional_tags {
            client.tag(&loaded, &format!("{}:{}", name, tag))?;
            progress.dispatch_progress(1);
        }
        Ok(())
    }

    fn image_tarball(&self, built: &BuiltImage, tags: Vec<String>) -> ImageTarball {
        let layers = built
            .layers
            .iter()
            .map(|layer| TarballLayer {
                diff_id: layer.diff_id().clone(),
                blob: layer.blob().clone(),
            })
            .collect();
        ImageTarball::new(built.image.clone(), layers, self.containerizer.target_image.clone(), tags)
    }

    fn retrieve_credential(&self, image_reference: &ImageReference, known: Option<Credential>, source: &str) -> Result<Option<Credential>> {
        let mut factory = CredentialRetrieverFactory::for_image(image_reference, &self.event_handlers);
        if let Some(directory) = &self.containerizer.credential_helper_directory {
            factory = factory.with_helper_directory(directory);
        }
        if let Some(helper) = &self.containerizer.credential_helper {
            factory = factory.with_credential_helper(helper);
        }
        retrieve_first(&factory.default_chain(known, source))
    }

    fn open_registry(&self, image_reference: &ImageReference, credential: Option<Credential>) -> Result<Arc<RegistryClient>> {
        let create_info = RegistryCreateInfo {
            credential,
            conn_timeout_second: self.containerizer.connection_timeout_seconds,
            allow_insecure: self.containerizer.allow_insecure_registries,
            user_agent: format!("{}/{}", self.containerizer.tool_name, env!("CARGO_PKG_VERSION")),
        };
        Ok(Arc::new(RegistryClient::open(true, image_reference, create_info, &self.event_handlers)?))
    }
}

fn image_layer(layer: &CachedLayer) -> ImageLayer {
    ImageLayer {
        blob_descriptor: BlobDescriptor::new(layer.size(), layer.digest().clone()),
        diff_id: layer.diff_id().clone(),
    }
}

fn progress_callback(progress: &Arc<Mutex<ProgressEventDispatcher>>) -> ByteCountCallback {
    let progress = progress.clone();
    Arc::new(move |count| {
        if let Ok(mut progress) = progress.lock() {
            progress.dispatch_progress(count);
        }
    })
}

fn join<T>(handle: ScopedJoinHandle<'_, Result<T>>) -> Result<T> {
    handle.join().unwrap_or_else(|payload| std::panic::resume_unwind(payload))
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, HashMap};
    use std::io::Read;

    use httptest::matchers::*;
    use httptest::responders::*;
    use httptest::{all_of, Expectation, Server};

    use super::*;
    use crate::credential::helper::tests::write_script;
    use crate::docker::tarball::{TarManifestJson, CONFIG_JSON, MANIFEST_JSON};
    use crate::event::progress::{ProgressEventHandler, ProgressUpdate};
    use crate::layer::entry::{AbsoluteUnixPath, LayerEntry};

    fn app_layer(dir: &Path) -> FileEntriesLayer {
        let source = dir.join("app.txt");
        fs::write(&source, b"hello fibpack").unwrap();
        let entry = LayerEntry::new(&source, AbsoluteUnixPath::parse("/app/app.txt").unwrap(), None, None).unwrap();
        FileEntriesLayer::new("classes", vec![entry])
    }

    fn read_tar(path: &Path) -> BTreeMap<String, Vec<u8>> {
        let file = fs::File::open(path).unwrap();
        let mut archive = tar::Archive::new(file);
        let mut entries = BTreeMap::new();
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            let name = entry.path().unwrap().to_string_lossy().to_string();
            let mut contents = Vec::new();
            entry.read_to_end(&mut contents).unwrap();
            entries.insert(name, contents);
        }
        entries
    }

    #[test]
    fn scratch_image_to_tar() {
        let dir = tempfile::tempdir().unwrap();
        let updates = Arc::new(Mutex::new(Vec::<ProgressUpdate>::new()));
        let recorder = updates.clone();
        let progress_handler = Arc::new(ProgressEventHandler::new(move |update| recorder.lock().unwrap().push(update)));
        let handlers = progress_handler.clone().register(EventHandlers::builder()).build();

        let builder = FibContainerBuilder::from_scratch()
            .add_layer(app_layer(dir.path()))
            .set_entrypoint(Some(vec!["/app/run".to_string()]))
            .add_environment_variable("MODE", "test")
            .add_exposed_port("8080")
            .unwrap();
        let output = dir.path().join("out").join("image.tar");
        let containerizer = Containerizer::to_tar(ImageReference::parse("app:1.0").unwrap(), &output)
            .with_additional_tag("latest")
            .unwrap()
            .set_base_image_layers_cache(dir.path().join("base-cache"))
            .set_application_layers_cache(dir.path().join("app-cache"))
            .set_event_handlers(handlers);
        let container = builder.containerize(&containerizer).unwrap();

        let entries = read_tar(&output);
        let manifest = serde_json::from_slice::<Vec<TarManifestJson>>(&entries[MANIFEST_JSON]).unwrap();
        assert_eq!(manifest[0].repo_tags, vec!["app:1.0".to_string(), "app:latest".to_string()]);
        assert_eq!(manifest[0].layers.len(), 1);
        assert!(entries.contains_key(&manifest[0].layers[0]));

        let config_bytes = &entries[CONFIG_JSON];
        assert_eq!(&container.image_id, compute_digest_of_bytes(config_bytes).digest());
        let config = serde_json::from_slice::<serde_json::Value>(config_bytes).unwrap();
        assert_eq!(config["created"], "1970-01-01T00:00:00Z");
        assert_eq!(config["config"]["Entrypoint"][0], "/app/run");
        assert_eq!(config["config"]["Env"][0], "MODE=test");
        assert!(config["config"]["ExposedPorts"]["8080/tcp"].is_object());
        assert_eq!(config["history"][0]["comment"], "classes");
        assert_eq!(container.tags.iter().cloned().collect::<Vec<String>>(), vec!["1.0", "latest"]);

        let last = updates.lock().unwrap().last().cloned().unwrap();
        assert!((last.progress - 1.0).abs() < 1e-9, "{:?}", last);
        assert!(progress_handler.completion_tracker().unfinished_allocations().is_empty());

        // Same inputs, same image.
        let again = builder.containerize(&containerizer.set_event_handlers(EventHandlers::none())).unwrap();
        assert_eq!(again.image_digest, container.image_digest);
        assert_eq!(again.image_id, container.image_id);
    }

    #[test]
    fn offline_build_needs_a_cached_base_image() {
        let dir = tempfile::tempdir().unwrap();
        let builder = FibContainerBuilder::from(ImageReference::parse("r.example/base:1").unwrap());
        let containerizer = Containerizer::to_tar(ImageReference::parse("app").unwrap(), dir.path().join("image.tar"))
            .set_base_image_layers_cache(dir.path().join("cache"))
            .set_offline_mode(true)
            .unwrap();
        let err = builder.containerize(&containerizer).unwrap_err();
        assert!(err.to_string().contains("offline"), "{}", err);
    }

    #[test]
    fn docker_daemon_loads_and_tags() {
        let dir = tempfile::tempdir().unwrap();
        let calls = dir.path().join("calls");
        let docker = write_script(
            dir.path(),
            "docker",
            &format!("echo \"$@\" >> {}\n[ \"$1\" = load ] && cat > /dev/null && echo 'Loaded image: app:1'\nexit 0", calls.display()),
        );
        let containerizer = Containerizer::to_docker_daemon(ImageReference::parse("app:1").unwrap(), DockerClient::new(docker, HashMap::new()))
            .with_additional_tag("latest")
            .unwrap()
            .set_base_image_layers_cache(dir.path().join("cache"));
        FibContainerBuilder::from_scratch()
            .add_layer(app_layer(dir.path()))
            .containerize(&containerizer)
            .unwrap();
        assert_eq!(fs::read_to_string(&calls).unwrap(), "load\ntag app:1 app:latest\n");
    }

    #[test]
    fn pushes_layers_config_and_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let server = Server::run();
        let blob_path = "^/v2/team/app/blobs/sha256:[0-9a-f]{64}$";
        server.expect(
            Expectation::matching(request::method_path("HEAD", matches(blob_path)))
                .times(2)
                .respond_with(status_code(404)),
        );
        server.expect(
            Expectation::matching(request::method_path("POST", "/v2/team/app/blobs/uploads/"))
                .times(2)
                .respond_with(status_code(202).insert_header("Location", "/upload/session")),
        );
        server.expect(
            Expectation::matching(request::method_path("PATCH", "/upload/session"))
                .times(2)
                .respond_with(status_code(202).insert_header("Location", "/upload/session")),
        );
        server.expect(
            Expectation::matching(all_of![
                request::method_path("PUT", "/upload/session"),
                request::query(url_decoded(contains(key("digest")))),
            ])
            .times(2)
            .respond_with(status_code(201)),
        );
        server.expect(
            Expectation::matching(all_of![
                request::method_path("PUT", "/v2/team/app/manifests/1.0"),
                request::headers(contains(("content-type", "application/vnd.docker.distribution.manifest.v2+json"))),
            ])
            .respond_with(status_code(201)),
        );

        let target = ImageReference::parse(&format!("{}/team/app:1.0", server.addr())).unwrap();
        let containerizer = Containerizer::to_registry(target, None)
            .set_allow_insecure_registries(true)
            .set_credential_helper_directory(dir.path())
            .set_base_image_layers_cache(dir.path().join("cache"));
        let container = FibContainerBuilder::from_scratch()
            .add_layer(app_layer(dir.path()))
            .containerize(&containerizer)
            .unwrap();
        assert_eq!(container.image_digest.to_string().len(), 71);
    }
}
