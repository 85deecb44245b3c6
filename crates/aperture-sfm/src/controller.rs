//! The mapping controller: discovers one model after another and reports
//! progress through registered callbacks.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use aperture_features::Database;
use aperture_image::Bitmap;
use aperture_scene::Reconstruction;

use crate::error::SfmError;
use crate::graph::CorrespondenceGraph;
use crate::mapper::{IncrementalMapper, MapperOptions};

/// Progress events emitted while mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MapperEvent {
    /// A model was initialized from a two-view pair.
    InitialPairRegistered,
    /// An image was registered into the current model.
    ImageRegistered,
    /// The current model registered its last image.
    LastImageRegistered,
}

type Callback = Box<dyn FnMut(&ReconstructionManager) + Send>;

/// An ordered collection of reconstructions.
#[derive(Debug, Default)]
pub struct ReconstructionManager {
    reconstructions: Vec<Reconstruction>,
}

impl ReconstructionManager {
    /// Creates an empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of reconstructions.
    pub fn len(&self) -> usize {
        self.reconstructions.len()
    }

    /// True when no reconstruction is held.
    pub fn is_empty(&self) -> bool {
        self.reconstructions.is_empty()
    }

    /// Reconstruction by index.
    pub fn get(&self, idx: usize) -> Option<&Reconstruction> {
        self.reconstructions.get(idx)
    }

    /// Mutable reconstruction by index.
    pub fn get_mut(&mut self, idx: usize) -> Option<&mut Reconstruction> {
        self.reconstructions.get_mut(idx)
    }

    /// Appends a reconstruction and returns its index.
    pub fn add(&mut self, recon: Reconstruction) -> usize {
        self.reconstructions.push(recon);
        self.reconstructions.len() - 1
    }

    /// Reads a single model from `path` into the manager.
    pub fn read(&mut self, path: impl AsRef<Path>) -> Result<usize, SfmError> {
        let recon = Reconstruction::read(path)?;
        Ok(self.add(recon))
    }

    /// Writes every model to `path/<index>` in binary format.
    pub fn write_all(&self, path: impl AsRef<Path>) -> Result<(), SfmError> {
        let path = path.as_ref();
        for (idx, recon) in self.reconstructions.iter().enumerate() {
            let model_path = path.join(idx.to_string());
            std::fs::create_dir_all(&model_path)?;
            recon.write(&model_path)?;
        }
        Ok(())
    }
}

/// Options for the mapping controller.
#[derive(Debug, Clone)]
pub struct MapperControllerOptions {
    /// Mapper parameters.
    pub mapper: MapperOptions,
    /// Upper bound on discovered models.
    pub max_num_models: usize,
    /// Models with fewer registered images are discarded.
    pub min_model_size: usize,
    /// When set, point colors are sampled from the images under this root.
    pub image_path: Option<PathBuf>,
}

impl Default for MapperControllerOptions {
    fn default() -> Self {
        Self {
            mapper: MapperOptions::default(),
            max_num_models: 10,
            min_model_size: 3,
            image_path: None,
        }
    }
}

/// Runs incremental mapping over a feature database, producing one or more
/// reconstructions.
pub struct IncrementalMapperController {
    database_path: PathBuf,
    options: MapperControllerOptions,
    manager: ReconstructionManager,
    callbacks: Vec<(MapperEvent, Callback)>,
}

impl IncrementalMapperController {
    /// Creates a controller starting from an empty set of models.
    pub fn new(database_path: impl Into<PathBuf>, options: MapperControllerOptions) -> Self {
        Self::with_manager(database_path, options, ReconstructionManager::new())
    }

    /// Creates a controller that continues a previously loaded model set.
    pub fn with_manager(
        database_path: impl Into<PathBuf>,
        options: MapperControllerOptions,
        manager: ReconstructionManager,
    ) -> Self {
        Self {
            database_path: database_path.into(),
            options,
            manager,
            callbacks: Vec::new(),
        }
    }

    /// Registers a callback for a mapping event.
    pub fn add_callback(
        &mut self,
        event: MapperEvent,
        callback: impl FnMut(&ReconstructionManager) + Send + 'static,
    ) {
        self.callbacks.push((event, Box::new(callback)));
    }

    fn fire(
        callbacks: &mut [(MapperEvent, Callback)],
        manager: &ReconstructionManager,
        event: MapperEvent,
    ) {
        for (registered_event, callback) in callbacks.iter_mut() {
            if *registered_event == event {
                callback(manager);
            }
        }
    }

    /// Runs mapping to completion and returns the reconstructions.
    pub fn run(mut self) -> Result<ReconstructionManager, SfmError> {
        let db = Database::open(&self.database_path)?;
        let graph = CorrespondenceGraph::from_database(&db)?;
        log::info!(
            "Mapping {} images over {} verified pairs",
            graph.images.len(),
            db.num_verified_pairs()
        );

        // Images claimed by already loaded models are not reused.
        let mut used_images: HashSet<u32> = HashSet::new();
        for idx in 0..self.manager.len() {
            if let Some(recon) = self.manager.get(idx) {
                used_images.extend(recon.registered_image_ids().iter().copied());
            }
        }

        let resuming = !self.manager.is_empty();
        if resuming {
            // Continue registering into the last loaded model.
            let mut recon = Reconstruction::new();
            std::mem::swap(self.manager.get_mut(self.manager.len() - 1).unwrap(), &mut recon);
            let mut mapper =
                IncrementalMapper::resume(&graph, self.options.mapper.clone(), recon, &used_images);
            while let Some(_image_id) = mapper.register_next_image() {
                Self::fire(
                    &mut self.callbacks,
                    &self.manager,
                    MapperEvent::ImageRegistered,
                );
            }
            mapper.finalize();
            let last = self.manager.len() - 1;
            *self.manager.get_mut(last).unwrap() = mapper.recon;
            self.color_model(last)?;
            Self::fire(
                &mut self.callbacks,
                &self.manager,
                MapperEvent::LastImageRegistered,
            );
            return Ok(self.manager);
        }

        while self.manager.len() < self.options.max_num_models {
            let mut mapper = IncrementalMapper::new(
                &graph,
                self.options.mapper.clone(),
                used_images.clone(),
            );
            if mapper.initialize().is_none() {
                break;
            }
            Self::fire(
                &mut self.callbacks,
                &self.manager,
                MapperEvent::InitialPairRegistered,
            );

            while let Some(_image_id) = mapper.register_next_image() {
                Self::fire(
                    &mut self.callbacks,
                    &self.manager,
                    MapperEvent::ImageRegistered,
                );
            }
            mapper.finalize();

            let recon = mapper.recon;
            used_images.extend(recon.registered_image_ids().iter().copied());

            if recon.num_registered_images() < self.options.min_model_size {
                log::info!(
                    "Discarding model with {} images (minimum {})",
                    recon.num_registered_images(),
                    self.options.min_model_size
                );
                continue;
            }

            let idx = self.manager.add(recon);
            self.color_model(idx)?;
            Self::fire(
                &mut self.callbacks,
                &self.manager,
                MapperEvent::LastImageRegistered,
            );
        }

        log::info!("Mapping finished with {} model(s)", self.manager.len());
        Ok(self.manager)
    }

    fn color_model(&mut self, idx: usize) -> Result<(), SfmError> {
        let Some(image_path) = self.options.image_path.clone() else {
            return Ok(());
        };
        if let Some(recon) = self.manager.get_mut(idx) {
            extract_colors(recon, &image_path);
        }
        Ok(())
    }
}

/// Samples each point's color from the first image that observes it.
///
/// Images that fail to load leave their points at the placeholder color.
pub fn extract_colors(recon: &mut Reconstruction, image_path: &Path) {
    let image_ids: Vec<u32> = recon.registered_image_ids().to_vec();
    for image_id in image_ids {
        let Some(image) = recon.images.get(&image_id) else {
            continue;
        };
        let name = image.name.clone();
        let bitmap = match Bitmap::load(image_path.join(&name)) {
            Ok(bitmap) => bitmap,
            Err(e) => {
                log::warn!("Could not read {} for point colors: {}", name, e);
                continue;
            }
        };
        let assignments: Vec<(u64, [u8; 3])> = recon.images[&image_id]
            .points2
            .iter()
            .filter_map(|point2| {
                let point3d_id = point2.point3d_id?;
                let color = bitmap.bilinear(point2.xy[0], point2.xy[1])?;
                Some((
                    point3d_id,
                    [color[0] as u8, color[1] as u8, color[2] as u8],
                ))
            })
            .collect();
        for (point3d_id, color) in assignments {
            if let Some(point) = recon.points3d.get_mut(&point3d_id) {
                if point.color == [128, 128, 128] {
                    point.color = color;
                }
            }
        }
    }
}
