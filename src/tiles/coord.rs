//! Web Mercator tile coordinates.

use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::fmt;

/// Latitude limit of the Web Mercator projection.
pub const MAX_LAT: f64 = 85.05112878;
pub const MIN_LAT: f64 = -MAX_LAT;

/// Deepest zoom the planner will produce.
pub const MAX_ZOOM: u8 = 22;

/// One raster tile in the slippy-map scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TileId {
  pub z: u8,
  pub x: u32,
  pub y: u32,
}

impl TileId {
  pub fn new(z: u8, x: u32, y: u32) -> Self {
    Self { z, x, y }
  }

  /// Expand a `{s}/{z}/{x}/{y}` URL template for this tile.
  pub fn url(&self, template: &str, subdomain: &str) -> String {
    template
      .replace("{z}", &self.z.to_string())
      .replace("{x}", &self.x.to_string())
      .replace("{y}", &self.y.to_string())
      .replace("{s}", subdomain)
  }
}

impl fmt::Display for TileId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}/{}/{}", self.z, self.x, self.y)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatLng {
  pub lat: f64,
  pub lng: f64,
}

impl LatLng {
  pub fn new(lat: f64, lng: f64) -> Self {
    Self { lat, lng }
  }
}

/// A viewport given by its north-east and south-west corners.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
  pub north_east: LatLng,
  pub south_west: LatLng,
}

impl Bounds {
  pub fn new(north: f64, south: f64, east: f64, west: f64) -> Self {
    Self {
      north_east: LatLng::new(north, east),
      south_west: LatLng::new(south, west),
    }
  }
}

/// Tile column and row containing a point at `zoom`.
///
/// Latitudes are clamped to the projection limits and indices to the tile
/// grid, so poles and the antimeridian map onto edge tiles.
pub fn lat_lng_to_tile(lat: f64, lng: f64, zoom: u8) -> (u32, u32) {
  let n = 2.0_f64.powi(zoom as i32);
  let lat = lat.clamp(MIN_LAT, MAX_LAT);
  let lat_rad = lat * PI / 180.0;

  let x = ((lng + 180.0) / 360.0 * n).floor();
  let y = ((1.0 - (lat_rad.tan() + 1.0 / lat_rad.cos()).ln() / PI) / 2.0 * n).floor();

  (clamp_index(x, n), clamp_index(y, n))
}

fn clamp_index(value: f64, n: f64) -> u32 {
  if value.is_nan() {
    return 0;
  }
  value.clamp(0.0, n - 1.0) as u32
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_new_york_city_at_zoom_16() {
    // New York City: 40.7128°N, 74.0060°W
    assert_eq!(lat_lng_to_tile(40.7128, -74.0060, 16), (19295, 24640));
  }

  #[test]
  fn test_origin_at_zoom_1() {
    assert_eq!(lat_lng_to_tile(0.0, 0.0, 1), (1, 1));
    assert_eq!(lat_lng_to_tile(0.0, 0.0, 0), (0, 0));
  }

  #[test]
  fn test_edges_clamp_to_grid() {
    assert_eq!(lat_lng_to_tile(90.0, 180.0, 2), (3, 0));
    assert_eq!(lat_lng_to_tile(-90.0, -180.0, 2), (0, 3));
  }

  #[test]
  fn test_url_template_expansion() {
    let tile = TileId::new(14, 11724, 7536);
    assert_eq!(
      tile.url("https://{s}.tile.openstreetmap.org/{z}/{x}/{y}.png", "a"),
      "https://a.tile.openstreetmap.org/14/11724/7536.png"
    );
    assert_eq!(tile.to_string(), "14/11724/7536");
  }
}
