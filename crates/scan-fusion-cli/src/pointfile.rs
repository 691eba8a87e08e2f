//! Whitespace-separated point files.
//!
//! One point per line, `#` starts a comment:
//!
//! ```text
//! x y z
//! x y z confidence
//! x y z nx ny nz
//! x y z nx ny nz confidence
//! ```

use std::path::Path;

use anyhow::{Context, Result, bail};
use nalgebra::{Point3, Vector3};
use scan_fusion::{Feature, Point, PointCloud};

/// One parsed line.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Record {
    pub position: Point3<f64>,
    pub normal: Option<Vector3<f64>>,
    pub confidence: Option<f64>,
}

pub fn parse_records(text: &str) -> Result<Vec<Record>> {
    let mut records = Vec::new();
    for (line_no, line) in text.lines().enumerate() {
        let content = line.split('#').next().unwrap_or("").trim();
        if content.is_empty() {
            continue;
        }
        let values = content
            .split_whitespace()
            .map(str::parse::<f64>)
            .collect::<Result<Vec<_>, _>>()
            .with_context(|| format!("line {}: expected numbers", line_no + 1))?;

        let (normal, confidence) = match values.len() {
            3 => (None, None),
            4 => (None, Some(values[3])),
            6 => (Some(Vector3::new(values[3], values[4], values[5])), None),
            7 => (
                Some(Vector3::new(values[3], values[4], values[5])),
                Some(values[6]),
            ),
            n => bail!("line {}: expected 3, 4, 6 or 7 columns, found {}", line_no + 1, n),
        };
        let normal = match normal {
            Some(n) if n.norm() > 0.0 => Some(n.normalize()),
            Some(_) => bail!("line {}: zero-length normal", line_no + 1),
            None => None,
        };

        records.push(Record {
            position: Point3::new(values[0], values[1], values[2]),
            normal,
            confidence,
        });
    }
    Ok(records)
}

fn read_records(path: &Path) -> Result<Vec<Record>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read point file {:?}", path))?;
    parse_records(&text).with_context(|| format!("Failed to parse {:?}", path))
}

/// Cloud from records; a missing confidence means full confidence.
pub fn to_cloud(records: &[Record]) -> PointCloud {
    records
        .iter()
        .map(|r| {
            let point = Point::from_position(r.position).with_confidence(r.confidence.unwrap_or(1.0));
            match r.normal {
                Some(n) => point.with_normal(n),
                None => point,
            }
        })
        .collect()
}

/// Features numbered by line order; a missing normal faces the camera.
pub fn to_features(records: &[Record]) -> Vec<Feature> {
    records
        .iter()
        .enumerate()
        .map(|(i, r)| {
            Feature::new(
                i as u64,
                r.position,
                r.normal.unwrap_or(-Vector3::z()),
                r.confidence.unwrap_or(1.0),
            )
        })
        .collect()
}

pub fn load_cloud(path: &Path) -> Result<PointCloud> {
    Ok(to_cloud(&read_records(path)?))
}

pub fn load_features(path: &Path) -> Result<Vec<Feature>> {
    Ok(to_features(&read_records(path)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_all_layouts() {
        let text = "\
# header
0 0 1
1 0 1 0.5
0 1 1 0 0 -2
1 1 1 0 0 -1 0.25   # trailing comment
";
        let records = parse_records(text).unwrap();
        assert_eq!(records.len(), 4);
        assert_eq!(records[0].normal, None);
        assert_eq!(records[0].confidence, None);
        assert_eq!(records[1].confidence, Some(0.5));
        assert_eq!(records[2].normal, Some(Vector3::new(0.0, 0.0, -1.0)));
        assert_eq!(records[3].confidence, Some(0.25));
    }

    #[test]
    fn test_bad_column_count_names_the_line() {
        let err = parse_records("0 0 1\n1 2\n").unwrap_err();
        assert!(err.to_string().contains("line 2"), "{}", err);
    }

    #[test]
    fn test_non_numeric_is_rejected() {
        assert!(parse_records("0 0 x\n").is_err());
        assert!(parse_records("0 0 1 0 0 0\n").is_err());
    }

    #[test]
    fn test_cloud_defaults() {
        let records = parse_records("0 0 1\n0 0 2 0.3\n").unwrap();
        let cloud = to_cloud(&records);
        assert_eq!(cloud.len(), 2);
        assert_eq!(cloud.points()[0].confidence, 1.0);
        assert_eq!(cloud.points()[1].confidence, 0.3);
    }

    #[test]
    fn test_features_face_camera_by_default() {
        let features = to_features(&parse_records("0 0 1\n").unwrap());
        assert_eq!(features[0].id, 0);
        assert_eq!(features[0].normal, -Vector3::z());
    }
}
