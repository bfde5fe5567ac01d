//! Point extraction and place resolution.
//!
//! An explicit place block wins. Otherwise the post's point is matched against the bounding
//! boxes of places already known to the store; no external geocoder is consulted.

use serde_json::Value as JsonValue;
use twload_core::{Coordinates, Place, PlaceRef, MAX_BOUNDING_BOX_CORNERS};
use twload_storage::{EntityStore, StoreError};

use crate::raw::RawPlace;
use crate::{non_empty, Anomaly, AnomalyLog};

/// Point of a post as `[longitude, latitude]`.
///
/// `coordinates` is GeoJSON (`{"type":"Point","coordinates":[lon, lat]}`) and wins; the
/// legacy `geo` field carries `[lat, lon]` and is swapped. A bare pair is accepted for
/// `coordinates` so already-flattened records replay cleanly.
pub fn extract_point(coordinates: Option<&JsonValue>, geo: Option<&JsonValue>) -> Option<Coordinates> {
    let from_geojson = coordinates.and_then(|value| {
        pair_of(value).or_else(|| value.get("coordinates").and_then(pair_of))
    });
    from_geojson.or_else(|| {
        geo.and_then(|value| value.get("coordinates"))
            .and_then(pair_of)
            .map(|[lat, lon]| [lon, lat])
    })
}

fn pair_of(value: &JsonValue) -> Option<Coordinates> {
    let [first, second] = value.as_array()?.as_slice() else {
        return None;
    };
    let (first, second) = (first.as_f64()?, second.as_f64()?);
    (first.is_finite() && second.is_finite()).then_some([first, second])
}

/// Stored form of an explicit place block; `None` without an `id`.
pub fn place_record(raw: RawPlace) -> Option<Place> {
    let id = non_empty(raw.id)?;
    let bounding_box_type = raw
        .bounding_box
        .as_ref()
        .and_then(|bbox| bbox.get("type"))
        .and_then(JsonValue::as_str)
        .map(str::to_string);
    let bounding_box = raw
        .bounding_box
        .as_ref()
        .and_then(|bbox| bbox.get("coordinates"))
        .and_then(|rings| rings.get(0))
        .and_then(JsonValue::as_array)
        .map(|ring| {
            ring.iter()
                .filter_map(pair_of)
                .take(MAX_BOUNDING_BOX_CORNERS)
                .collect()
        })
        .unwrap_or_default();

    Some(Place {
        id,
        name: raw.name,
        full_name: raw.full_name,
        country: raw.country,
        country_code: raw.country_code,
        place_type: raw.place_type,
        url: raw.url,
        bounding_box_type,
        bounding_box,
    })
}

/// Resolve the post's place reference, upserting an explicit place (last write wins).
pub fn resolve(
    places: &mut dyn EntityStore<Place>,
    explicit: Option<RawPlace>,
    point: Option<Coordinates>,
    anomalies: &mut AnomalyLog,
) -> Result<Option<PlaceRef>, StoreError> {
    if let Some(raw) = explicit {
        let label = raw.full_name.clone().unwrap_or_default();
        match place_record(raw) {
            Some(place) => {
                let reference = PlaceRef {
                    id: place.id.clone(),
                };
                places.upsert(place)?;
                return Ok(Some(reference));
            }
            None => anomalies.record(Anomaly::PlaceWithoutId, &label),
        }
    }

    match point {
        Some(point) => derive_from_point(&*places, point),
        None => Ok(None),
    }
}

/// Smallest known place whose bounding box contains `point`.
pub fn derive_from_point(
    places: &dyn EntityStore<Place>,
    point: Coordinates,
) -> Result<Option<PlaceRef>, StoreError> {
    let mut best: Option<(String, f64)> = None;
    places.scan(&mut |place: &Place| {
        if !place.contains(point) {
            return;
        }
        let area = place.area().unwrap_or(f64::INFINITY);
        if best.as_ref().map_or(true, |(_, smallest)| area.total_cmp(smallest).is_lt()) {
            best = Some((place.id.clone(), area));
        }
    })?;
    Ok(best.map(|(id, _)| PlaceRef { id }))
}
