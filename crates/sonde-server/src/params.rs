//! Builds store filters from recognised query parameters.

use std::collections::BTreeSet;

use sonde_datastore::filter::{
    DataStreamFilter, FoiFilter, ObsFilter, PropertyPredicate, SpatialFilter, SystemFilter,
    TemporalFilter,
};
use sonde_types::{Bbox, Geometry, IdEncoder, InternalId, PropValue, Timestamp};

use crate::resource::{ApiError, QueryParams};

/// Parses a temporal parameter: `now`, `latest`, one instant, or
/// `begin/end` where either side may be `..` for an open bound.
pub fn parse_temporal(value: &str) -> Result<TemporalFilter, ApiError> {
    let invalid = || ApiError::BadRequest(format!("invalid time parameter: {value:?}"));
    match value {
        "now" => Ok(TemporalFilter::CurrentTime { tolerance_ms: 0 }),
        "latest" => Ok(TemporalFilter::LatestVersion),
        _ => match value.split_once('/') {
            None => {
                let t = Timestamp::parse_iso(value).ok_or_else(invalid)?;
                Ok(TemporalFilter::Single(t))
            }
            Some((begin, end)) => {
                let begin = match begin {
                    ".." => Timestamp::MIN,
                    b => Timestamp::parse_iso(b).ok_or_else(invalid)?,
                };
                let end = match end {
                    ".." => Timestamp::MAX,
                    e => Timestamp::parse_iso(e).ok_or_else(invalid)?,
                };
                if begin > end {
                    return Err(invalid());
                }
                Ok(TemporalFilter::range(begin, end))
            }
        },
    }
}

fn parse_bbox(value: &str) -> Result<Bbox, ApiError> {
    let parts: Vec<f64> = value
        .split(',')
        .map(|p| p.trim().parse::<f64>())
        .collect::<Result<_, _>>()
        .map_err(|_| ApiError::BadRequest(format!("invalid bbox: {value:?}")))?;
    match parts.as_slice() {
        [min_lon, min_lat, max_lon, max_lat] => {
            Ok(Bbox::new(*min_lon, *min_lat, *max_lon, *max_lat))
        }
        _ => Err(ApiError::BadRequest(format!(
            "bbox must be minLon,minLat,maxLon,maxLat: {value:?}"
        ))),
    }
}

fn spatial_from_query(q: &QueryParams) -> Result<Option<SpatialFilter>, ApiError> {
    if let Some(bbox) = q.get("bbox") {
        return Ok(Some(SpatialFilter::intersects(parse_bbox(bbox)?)));
    }
    if let Some(wkt) = q.get("geom") {
        let geometry = Geometry::parse_wkt(wkt)
            .ok_or_else(|| ApiError::BadRequest(format!("invalid WKT geometry: {wkt:?}")))?;
        return Ok(Some(SpatialFilter::intersects(geometry.bbox())));
    }
    Ok(None)
}

fn property_predicates(q: &QueryParams) -> Vec<PropertyPredicate> {
    q.property_params()
        .into_iter()
        .map(|(name, pattern)| {
            // Numeric patterns match exactly, strings as globs.
            let expected = match pattern.parse::<f64>() {
                Ok(n) if !pattern.contains('*') && !pattern.contains('?') => PropValue::Number(n),
                _ => PropValue::Text(pattern.to_string()),
            };
            PropertyPredicate::new(name, expected)
        })
        .collect()
}

/// Decodes a multi-valued external-ID parameter. An undecodable ID yields
/// an ID set matching nothing rather than an error, mirroring single-get
/// semantics where tampered IDs read as absent.
fn id_set(q: &QueryParams, name: &str, encoder: &IdEncoder) -> Option<BTreeSet<InternalId>> {
    let raw = q.get_multi(name);
    if raw.is_empty() {
        return None;
    }
    Some(raw.iter().map(|r| encoder.decode(r)).filter(|id| *id > 0).collect())
}

pub fn system_filter(q: &QueryParams, encoder: &IdEncoder) -> Result<SystemFilter, ApiError> {
    let mut filter = SystemFilter::default();
    if let Some(ids) = id_set(q, "id", encoder) {
        filter = filter.with_internal_ids(ids);
    }
    let uids = q.get_multi("uid");
    if !uids.is_empty() {
        filter = filter.with_unique_ids(uids);
    }
    if let Some(vt) = q.get("validTime") {
        filter = filter.with_valid_time(parse_temporal(vt)?);
    } else {
        filter = filter.with_valid_time(TemporalFilter::LatestVersion);
    }
    if let Some(spatial) = spatial_from_query(q)? {
        filter = filter.with_location(spatial);
    }
    if let Some(t) = q.get("featureType") {
        filter = filter.with_feature_type(t);
    }
    for p in property_predicates(q) {
        filter = filter.with_property(p);
    }
    Ok(filter)
}

pub fn foi_filter(q: &QueryParams, encoder: &IdEncoder) -> Result<FoiFilter, ApiError> {
    let mut filter = FoiFilter::default();
    if let Some(ids) = id_set(q, "id", encoder) {
        filter = filter.with_internal_ids(ids);
    }
    let uids = q.get_multi("uid");
    if !uids.is_empty() {
        filter = filter.with_unique_ids(uids);
    }
    if let Some(vt) = q.get("validTime") {
        filter = filter.with_valid_time(parse_temporal(vt)?);
    } else {
        filter = filter.with_valid_time(TemporalFilter::LatestVersion);
    }
    if let Some(spatial) = spatial_from_query(q)? {
        filter = filter.with_location(spatial);
    }
    if let Some(t) = q.get("featureType") {
        filter = filter.with_feature_type(t);
    }
    for p in property_predicates(q) {
        filter = filter.with_property(p);
    }
    Ok(filter)
}

pub fn datastream_filter(
    q: &QueryParams,
    ds_encoder: &IdEncoder,
    sys_encoder: &IdEncoder,
) -> Result<DataStreamFilter, ApiError> {
    let mut filter = DataStreamFilter::default();
    if let Some(ids) = id_set(q, "id", ds_encoder) {
        filter = filter.with_internal_ids(ids);
    }
    if let Some(sys_ids) = id_set(q, "system", sys_encoder) {
        filter = filter.with_systems(SystemFilter::default().with_internal_ids(sys_ids));
    }
    let outputs = q.get_multi("outputName");
    if !outputs.is_empty() {
        filter = filter.with_output_names(outputs);
    }
    if let Some(vt) = q.get("validTime") {
        filter = filter.with_valid_time(parse_temporal(vt)?);
    }
    Ok(filter)
}

pub fn obs_filter(
    q: &QueryParams,
    ds_encoder: &IdEncoder,
    foi_encoder: &IdEncoder,
) -> Result<ObsFilter, ApiError> {
    let mut filter = ObsFilter::default();
    if let Some(ds_ids) = id_set(q, "datastream", ds_encoder) {
        filter = filter.with_data_streams(DataStreamFilter::default().with_internal_ids(ds_ids));
    }
    if let Some(foi_ids) = id_set(q, "foi", foi_encoder) {
        filter = filter.with_fois(FoiFilter::default().with_internal_ids(foi_ids));
    }
    if let Some(pt) = q.get("phenomenonTime") {
        filter = filter.with_phenomenon_time(parse_temporal(pt)?);
    }
    if let Some(rt) = q.get("resultTime") {
        filter = filter.with_result_time(parse_temporal(rt)?);
    }
    Ok(filter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temporal_forms() {
        assert!(matches!(
            parse_temporal("now").unwrap(),
            TemporalFilter::CurrentTime { tolerance_ms: 0 }
        ));
        assert!(matches!(
            parse_temporal("latest").unwrap(),
            TemporalFilter::LatestVersion
        ));
        assert!(matches!(
            parse_temporal("2024-01-01T00:00:00Z").unwrap(),
            TemporalFilter::Single(_)
        ));
        let range = parse_temporal("2024-01-01T00:00:00Z/2024-02-01T00:00:00Z").unwrap();
        assert!(matches!(range, TemporalFilter::Range { .. }));
        let open = parse_temporal("../2024-02-01T00:00:00Z").unwrap();
        match open {
            TemporalFilter::Range { begin, .. } => assert_eq!(begin, Timestamp::MIN),
            other => panic!("unexpected {other:?}"),
        }
        assert!(parse_temporal("yesterday-ish").is_err());
    }

    #[test]
    fn bbox_requires_four_numbers() {
        assert!(parse_bbox("1,2,3,4").is_ok());
        assert!(parse_bbox("1,2,3").is_err());
        assert!(parse_bbox("a,b,c,d").is_err());
    }

    #[test]
    fn default_valid_time_is_latest() {
        let q = QueryParams::parse(None).unwrap();
        let encoder = IdEncoder::new(1, 1);
        let f = system_filter(&q, &encoder).unwrap();
        assert!(matches!(f.valid_time, TemporalFilter::LatestVersion));
    }

    #[test]
    fn numeric_property_params_match_exactly() {
        let q = QueryParams::parse(Some("p:height=5&p:vendor=acme*")).unwrap();
        let preds = property_predicates(&q);
        assert_eq!(preds.len(), 2);
        assert_eq!(preds[0].expected, PropValue::Number(5.0));
        assert_eq!(preds[1].expected, PropValue::Text("acme*".to_string()));
    }
}
