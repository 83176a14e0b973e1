//! Which tiles to prefetch for a viewport.

use std::ops::RangeInclusive;

use super::coord::{lat_lng_to_tile, Bounds, TileId, MAX_ZOOM};

/// Coarsest zoom worth prefetching.
pub const MIN_PREFETCH_ZOOM: u8 = 10;

/// Zoom levels prefetched around `current_zoom`: two levels out, one level in.
///
/// Empty when `current_zoom + 1` is coarser than [`MIN_PREFETCH_ZOOM`].
/// Zooms past [`MAX_ZOOM`] plan the deepest level only.
pub fn zoom_range(current_zoom: u8) -> RangeInclusive<u8> {
  let min = current_zoom
    .saturating_sub(2)
    .clamp(MIN_PREFETCH_ZOOM, MAX_ZOOM);
  let max = current_zoom.saturating_add(1).min(MAX_ZOOM);
  min..=max
}

/// Column and row spans covering `bounds` at zoom `z`.
fn level_span(bounds: &Bounds, z: u8) -> (RangeInclusive<u32>, RangeInclusive<u32>) {
  let ne = lat_lng_to_tile(bounds.north_east.lat, bounds.north_east.lng, z);
  let sw = lat_lng_to_tile(bounds.south_west.lat, bounds.south_west.lng, z);
  (ne.0.min(sw.0)..=ne.0.max(sw.0), ne.1.min(sw.1)..=ne.1.max(sw.1))
}

/// Every tile covering `bounds` across the prefetch zoom range.
///
/// Yielded lazily by ascending zoom, then x, then y, so taking a prefix keeps
/// the coarse levels.
pub fn plan_tiles(bounds: &Bounds, current_zoom: u8) -> impl Iterator<Item = TileId> {
  let bounds = *bounds;
  zoom_range(current_zoom).flat_map(move |z| {
    let (xs, ys) = level_span(&bounds, z);
    xs.flat_map(move |x| ys.clone().map(move |y| TileId::new(z, x, y)))
  })
}

/// Number of tiles [`plan_tiles`] yields, counted per level.
pub fn plan_len(bounds: &Bounds, current_zoom: u8) -> usize {
  zoom_range(current_zoom)
    .map(|z| {
      let (xs, ys) = level_span(bounds, z);
      let width = (xs.end() - xs.start()) as usize + 1;
      let height = (ys.end() - ys.start()) as usize + 1;
      width.saturating_mul(height)
    })
    .fold(0usize, usize::saturating_add)
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::HashSet;

  fn plan(bounds: &Bounds, zoom: u8) -> Vec<TileId> {
    plan_tiles(bounds, zoom).collect()
  }

  #[test]
  fn test_zoom_range_bounds() {
    assert_eq!(zoom_range(14), 12..=15);
    assert_eq!(zoom_range(11), 10..=12);
    assert_eq!(zoom_range(9), 10..=10);
    assert!(zoom_range(8).is_empty());
    assert_eq!(zoom_range(255), 22..=22);
  }

  #[test]
  fn test_zoom_range_at_deepest_levels() {
    assert_eq!(zoom_range(21), 19..=22);
    assert_eq!(zoom_range(22), 20..=22);
    assert_eq!(zoom_range(23), 21..=22);
    assert_eq!(zoom_range(24), 22..=22);
    assert_eq!(zoom_range(25), 22..=22);
  }

  #[test]
  fn test_zoom_past_max_still_plans_deepest_level() {
    let bounds = Bounds::new(12.971, 12.970, 77.595, 77.594);
    let tiles = plan(&bounds, 30);

    assert!(!tiles.is_empty());
    assert!(tiles.iter().all(|t| t.z == MAX_ZOOM));
  }

  #[test]
  fn test_one_degree_box_at_zoom_14() {
    let bounds = Bounds::new(13.0, 12.0, 78.0, 77.0);
    let tiles = plan(&bounds, 14);

    assert!(!tiles.is_empty());
    let unique: HashSet<_> = tiles.iter().collect();
    assert_eq!(unique.len(), tiles.len());
    assert!(tiles.iter().all(|t| (12..=15).contains(&t.z)));
    assert_eq!(plan_len(&bounds, 14), tiles.len());
  }

  #[test]
  fn test_order_is_zoom_then_x_then_y() {
    let bounds = Bounds::new(12.99, 12.95, 77.62, 77.58);
    let tiles = plan(&bounds, 13);

    let mut sorted = tiles.clone();
    sorted.sort();
    assert_eq!(tiles, sorted);
    assert_eq!(tiles[0].z, 11);
  }

  #[test]
  fn test_prefix_keeps_coarsest_level() {
    let bounds = Bounds::new(13.0, 12.0, 78.0, 77.0);
    let coarsest = *zoom_range(14).start();
    let level = plan(&bounds, 14).iter().filter(|t| t.z == coarsest).count();

    let kept: Vec<_> = plan_tiles(&bounds, 14).take(level).collect();
    assert_eq!(kept.len(), level);
    assert!(kept.iter().all(|t| t.z == coarsest));
  }

  #[test]
  fn test_large_plan_is_counted_without_building_it() {
    let world = Bounds::new(85.0, -85.0, 180.0, -180.0);

    assert!(plan_len(&Bounds::new(13.0, 12.0, 78.0, 77.0), 20) > 40_000_000);
    assert!(plan_len(&world, 22) > 1usize << 40);

    let kept: Vec<_> = plan_tiles(&world, 22).take(200).collect();
    assert_eq!(kept.len(), 200);
    assert!(kept.iter().all(|t| t.z == 20));
  }

  #[test]
  fn test_rectangle_is_complete() {
    let bounds = Bounds::new(40.8, 40.6, -73.9, -74.1);
    let tiles = plan(&bounds, 10);

    for z in zoom_range(10) {
      let level: Vec<_> = tiles.iter().filter(|t| t.z == z).collect();
      let xs: HashSet<u32> = level.iter().map(|t| t.x).collect();
      let ys: HashSet<u32> = level.iter().map(|t| t.y).collect();
      assert_eq!(level.len(), xs.len() * ys.len());
    }
  }

  #[test]
  fn test_swapped_corners_give_same_plan() {
    let bounds = Bounds::new(13.0, 12.0, 78.0, 77.0);
    let swapped = Bounds {
      north_east: bounds.south_west,
      south_west: bounds.north_east,
    };
    assert_eq!(plan(&bounds, 12), plan(&swapped, 12));
  }

  #[test]
  fn test_low_zoom_plans_nothing() {
    let bounds = Bounds::new(13.0, 12.0, 78.0, 77.0);
    assert_eq!(plan_tiles(&bounds, 5).count(), 0);
    assert_eq!(plan_len(&bounds, 5), 0);
  }
}
