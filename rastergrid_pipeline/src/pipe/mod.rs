//! The staged tile pipeline: seed → filter → transform → postprocess →
//! upload → cleanup, with bounded queues between stages and a fixed worker
//! pool per stage.
//!
//! Tiles that leave the pending state keep flowing to the terminal sink,
//! which partitions the run into `(succeeded, skipped, failed)`; nothing is
//! dropped silently once seeded.

use crate::catalog::SourceCatalog;
use crate::layer::Layer;
use crate::postprocess::{GdalGeotiff, Postprocess};
use crate::storage::ObjectStore;
use crate::tile::{Tile, TileStatus};
use crate::transform::TransformEngine;
use anyhow::Result;
use async_trait::async_trait;
use geo::BoundingRect;
use rastergrid_core::{Bounds, CancelFlag, EnvSettings, GlobalResourceState, RasterGridError, RetryPolicy, TileId};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

/// Final partitioning of a run. Any non-empty `failed` set makes the
/// wrapping program exit non-zero.
#[derive(Debug, Default)]
pub struct PipeResults {
	pub succeeded: Vec<Tile>,
	pub skipped: Vec<Tile>,
	pub failed: Vec<Tile>,
}

impl PipeResults {
	pub fn counts(&self) -> (usize, usize, usize) {
		(self.succeeded.len(), self.skipped.len(), self.failed.len())
	}
}

/// The per-tile heavy lifting, behind a trait so the pipeline depends only
/// on the Tile contract (and tests can substitute a stub).
#[async_trait]
pub trait TileWorker: Send + Sync {
	/// Resolve the tile's source and transform it. Returns whether the tile
	/// produced data.
	async fn prepare_and_transform(&self, tile: &mut Tile) -> Result<bool>;
}

/// Production worker: resolve through the catalog, transform through the
/// GDAL engine.
struct EngineWorker {
	engine: TransformEngine,
	catalog: Arc<SourceCatalog>,
	store: Arc<dyn ObjectStore>,
	retry: RetryPolicy,
}

#[async_trait]
impl TileWorker for EngineWorker {
	async fn prepare_and_transform(&self, tile: &mut Tile) -> Result<bool> {
		tile.prepare(self.catalog.as_ref(), self.store.as_ref(), &self.retry).await?;
		self.engine.transform_tile(tile).await
	}
}

struct Shared {
	catalog: Arc<SourceCatalog>,
	store: Arc<dyn ObjectStore>,
	worker: Arc<dyn TileWorker>,
	postprocess: Arc<dyn Postprocess>,
	bucket: String,
	subset: Option<Vec<TileId>>,
	cancel: CancelFlag,
	retry: RetryPolicy,
	overwrite: bool,
}

/// Orchestrates one layer-version run.
pub struct Pipe {
	layer: Arc<Layer>,
	catalog: Arc<SourceCatalog>,
	store: Arc<dyn ObjectStore>,
	resources: GlobalResourceState,
	retry: RetryPolicy,
	cancel: CancelFlag,
	bucket: String,
	work_root: PathBuf,
	subset: Option<Vec<TileId>>,
	postprocess: Arc<dyn Postprocess>,
	worker: Option<Arc<dyn TileWorker>>,
}

impl std::fmt::Debug for Pipe {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Pipe")
			.field("layer", &self.layer)
			.field("catalog", &self.catalog)
			.field("resources", &self.resources)
			.field("retry", &self.retry)
			.field("cancel", &self.cancel)
			.field("bucket", &self.bucket)
			.field("work_root", &self.work_root)
			.field("subset", &self.subset)
			.finish_non_exhaustive()
	}
}

impl Pipe {
	pub fn new(
		layer: Arc<Layer>,
		catalog: Arc<SourceCatalog>,
		store: Arc<dyn ObjectStore>,
		settings: &EnvSettings,
		subset: Option<Vec<String>>,
		work_root: PathBuf,
		cancel: CancelFlag,
	) -> Result<Pipe> {
		let resources = GlobalResourceState::new(settings, layer.has_calc());
		let subset = match subset {
			None => None,
			Some(ids) => {
				let mut parsed = Vec::with_capacity(ids.len());
				for id in ids {
					let tile_id = TileId::new(id);
					layer
						.grid
						.origin_of(&tile_id)
						.map_err(|err| RasterGridError::Validation(format!("invalid subset tile id: {err:#}")))?;
					parsed.push(tile_id);
				}
				Some(parsed)
			}
		};
		Ok(Pipe {
			layer,
			catalog,
			store,
			resources,
			retry: RetryPolicy::default(),
			cancel,
			bucket: settings.environment.bucket(),
			work_root,
			subset,
			postprocess: Arc::new(GdalGeotiff),
			worker: None,
		})
	}

	/// Replace the post-processing hook.
	pub fn with_postprocess(mut self, hook: Arc<dyn Postprocess>) -> Pipe {
		self.postprocess = hook;
		self
	}

	/// Replace the tile worker; used by tests.
	pub fn with_worker(mut self, worker: Arc<dyn TileWorker>) -> Pipe {
		self.worker = Some(worker);
		self
	}

	/// Candidate tiles of the run: the subset when one is given, otherwise
	/// every grid cell overlapping the source footprint's bounding box.
	fn seed_tiles(&self) -> Result<Vec<Tile>> {
		let ids = match &self.subset {
			Some(subset) => subset.clone(),
			None => match self.catalog.footprint().bounding_rect() {
				None => Vec::new(),
				Some(rect) => {
					let bounds = Bounds::new(rect.min().x, rect.min().y, rect.max().x, rect.max().y)?;
					self.layer.grid.tile_ids_in_geographic_bounds(&bounds)
				}
			},
		};
		let mut tiles = Vec::with_capacity(ids.len());
		for tile_id in ids {
			tiles.push(Tile::new(tile_id, self.layer.clone(), &self.work_root)?);
		}
		log::info!("seeded {} candidate tiles", tiles.len());
		Ok(tiles)
	}

	/// Run the pipeline and partition the tiles into
	/// `(succeeded, skipped, failed)`.
	pub async fn create_tiles(&self, overwrite: bool) -> Result<PipeResults> {
		let tiles = self.seed_tiles()?;
		let workers = self.resources.workers;
		let queue = workers;

		let worker: Arc<dyn TileWorker> = match &self.worker {
			Some(worker) => worker.clone(),
			None => Arc::new(EngineWorker {
				engine: TransformEngine::new(self.resources, self.retry, self.cancel.clone()),
				catalog: self.catalog.clone(),
				store: self.store.clone(),
				retry: self.retry,
			}),
		};
		let shared = Arc::new(Shared {
			catalog: self.catalog.clone(),
			store: self.store.clone(),
			worker,
			postprocess: self.postprocess.clone(),
			bucket: self.bucket.clone(),
			subset: self.subset.clone(),
			cancel: self.cancel.clone(),
			retry: self.retry,
			overwrite,
		});

		// seed
		let (seed_tx, rx) = mpsc::channel::<Tile>(queue);
		{
			let cancel = self.cancel.clone();
			tokio::spawn(async move {
				for tile in tiles {
					if cancel.is_cancelled() {
						break;
					}
					if seed_tx.send(tile).await.is_err() {
						break;
					}
				}
			});
		}

		let rx = spawn_stage("filter_subset", workers, queue, rx, shared.clone(), filter_subset);
		let rx = spawn_stage("filter_exists", workers, queue, rx, shared.clone(), filter_exists);
		let rx = spawn_stage("filter_src_intersect", workers, queue, rx, shared.clone(), filter_src_intersect);
		let rx = spawn_stage("transform", workers, queue, rx, shared.clone(), transform);
		let rx = spawn_stage("filter_empty", workers, queue, rx, shared.clone(), filter_empty);
		let rx = spawn_stage("postprocess", workers, queue, rx, shared.clone(), postprocess);
		let rx = spawn_stage("upload", workers, queue, rx, shared.clone(), upload);
		let mut rx = spawn_stage("cleanup_local", workers, queue, rx, shared.clone(), cleanup_local);

		let mut results = PipeResults::default();
		while let Some(tile) = rx.recv().await {
			match tile.status() {
				TileStatus::Succeeded => results.succeeded.push(tile),
				TileStatus::Skipped => results.skipped.push(tile),
				TileStatus::Failed => results.failed.push(tile),
				TileStatus::Pending => {
					log::warn!("tile {} finished the pipeline still pending, counting as skipped", tile.tile_id);
					results.skipped.push(tile);
				}
			}
		}

		let (succeeded, skipped, failed) = results.counts();
		log::info!("pipeline finished: {succeeded} succeeded, {skipped} skipped, {failed} failed");
		Ok(results)
	}
}

/// Run one stage as a group of `workers` consumers on a shared inbound
/// queue, forwarding into a bounded outbound queue.
fn spawn_stage<F, Fut>(
	name: &'static str,
	workers: usize,
	queue: usize,
	rx: mpsc::Receiver<Tile>,
	shared: Arc<Shared>,
	f: F,
) -> mpsc::Receiver<Tile>
where
	F: Fn(Tile, Arc<Shared>) -> Fut + Clone + Send + 'static,
	Fut: Future<Output = Tile> + Send + 'static,
{
	let (tx, out_rx) = mpsc::channel(queue);
	let rx = Arc::new(Mutex::new(rx));
	for _ in 0..workers.max(1) {
		let rx = rx.clone();
		let tx = tx.clone();
		let f = f.clone();
		let shared = shared.clone();
		tokio::spawn(async move {
			loop {
				let tile = { rx.lock().await.recv().await };
				let Some(tile) = tile else { break };
				log::trace!("stage {name}: tile {}", tile.tile_id);
				let tile = f(tile, shared.clone()).await;
				if tx.send(tile).await.is_err() {
					break;
				}
			}
		});
	}
	out_rx
}

/// Restrict the run to an explicit tile-id list, when one is given.
async fn filter_subset(mut tile: Tile, shared: Arc<Shared>) -> Tile {
	if !tile.is_pending() {
		return tile;
	}
	if let Some(subset) = &shared.subset {
		if !subset.contains(&tile.tile_id) {
			tile.mark_skipped("not in subset");
		}
	}
	tile
}

/// Skip tiles whose destination object already exists, unless overwriting.
async fn filter_exists(mut tile: Tile, shared: Arc<Shared>) -> Tile {
	if !tile.is_pending() || shared.overwrite {
		return tile;
	}
	match tile.dst_exists(shared.store.as_ref(), &shared.bucket).await {
		Ok(true) => tile.mark_skipped("destination already exists"),
		Ok(false) => {}
		Err(err) => tile.mark_failed(&err),
	}
	tile
}

/// Skip tiles that do not overlap the source footprint.
async fn filter_src_intersect(mut tile: Tile, shared: Arc<Shared>) -> Tile {
	if !tile.is_pending() {
		return tile;
	}
	match tile.intersects_source(shared.catalog.as_ref()) {
		Ok(true) => {}
		Ok(false) => tile.mark_skipped("does not intersect source"),
		Err(err) => tile.mark_failed(&err),
	}
	tile
}

/// The heavy stage: resolve the source and run the transform engine.
/// Successful tiles with data move to `Succeeded`; empty tiles stay pending
/// for `filter_empty`.
async fn transform(mut tile: Tile, shared: Arc<Shared>) -> Tile {
	if !tile.is_pending() {
		return tile;
	}
	if shared.cancel.is_cancelled() {
		tile.mark_skipped("run cancelled");
		return tile;
	}
	match shared.worker.prepare_and_transform(&mut tile).await {
		Ok(true) => tile.mark_succeeded(),
		Ok(false) => {}
		Err(err) => tile.mark_failed(&err),
	}
	tile
}

/// Skip tiles whose transform produced no data and drop their partial
/// local files.
async fn filter_empty(mut tile: Tile, _shared: Arc<Shared>) -> Tile {
	if tile.is_pending() && tile.local_files().count() == 0 {
		tile.mark_skipped("no data within tile");
		tile.rm_local();
	}
	tile
}

/// Run the post-processing hook on successful tiles.
async fn postprocess(mut tile: Tile, shared: Arc<Shared>) -> Tile {
	if tile.status() != TileStatus::Succeeded {
		return tile;
	}
	if let Err(err) = shared.postprocess.run(&mut tile).await {
		tile.mark_failed(&err.context(RasterGridError::Transform("postprocessing failed".to_string())));
	}
	tile
}

/// Upload successful tiles to the destination bucket, bounded by the same
/// retry policy as source reads.
async fn upload(mut tile: Tile, shared: Arc<Shared>) -> Tile {
	if tile.status() != TileStatus::Succeeded {
		return tile;
	}
	let result = shared
		.retry
		.run("upload tile", rastergrid_core::error::is_transient_io, || {
			tile.upload(shared.store.as_ref(), &shared.bucket)
		})
		.await;
	if let Err(err) = result {
		tile.mark_failed(&err);
	}
	tile
}

/// Remove local files for every tile, whatever its terminal state; this is
/// the guarantee that temporaries never outlive the run.
async fn cleanup_local(mut tile: Tile, _shared: Arc<Shared>) -> Tile {
	tile.rm_local();
	tile
}
