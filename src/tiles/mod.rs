//! Tile-area planning and prefetch.

mod coord;
mod planner;
mod prefetch;

pub use coord::{lat_lng_to_tile, Bounds, LatLng, TileId, MAX_LAT, MAX_ZOOM, MIN_LAT};
pub use planner::{plan_len, plan_tiles, zoom_range, MIN_PREFETCH_ZOOM};
pub use prefetch::{PrefetchReport, TilePrefetcher};
