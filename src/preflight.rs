//! Checks run before any worker is launched.

use crate::model::{PreflightKind, SimulationRequest, ValidationLimits};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum PreflightError {
    #[error("No Space in total shelf space. Required: {required}, Available: {available}")]
    ShelfSpace { required: f64, available: f64 },
    #[error("Discount base must be between {min} and {max} (got {value})")]
    DiscountBase { value: f64, min: f64, max: f64 },
    #[error("Chromosome bits must be between {min} and {max} (got {value})")]
    ChromosomeBits { value: u32, min: u32, max: u32 },
    #[error("{name} must be a non-negative number (got {value})")]
    Budget { name: &'static str, value: f64 },
    #[error("Column mapping for '{0}' is missing or invalid")]
    Column(&'static str),
}

impl PreflightError {
    pub fn kind(&self) -> PreflightKind {
        match self {
            PreflightError::ShelfSpace { .. } => PreflightKind::ShelfSpace,
            _ => PreflightKind::Validation,
        }
    }
}

/// Validate a request. The first failing check wins, with shelf space checked first.
pub fn validate(req: &SimulationRequest, limits: &ValidationLimits) -> Result<(), PreflightError> {
    if req.required_shelf_space > req.shelf_space_limit {
        return Err(PreflightError::ShelfSpace {
            required: req.required_shelf_space,
            available: req.shelf_space_limit,
        });
    }

    // NaN fails the range check.
    if !(limits.discount_base_min..=limits.discount_base_max).contains(&req.discount_base) {
        return Err(PreflightError::DiscountBase {
            value: req.discount_base,
            min: limits.discount_base_min,
            max: limits.discount_base_max,
        });
    }

    if !(limits.chromosome_bits_min..=limits.chromosome_bits_max).contains(&req.chromosome_bits) {
        return Err(PreflightError::ChromosomeBits {
            value: req.chromosome_bits,
            min: limits.chromosome_bits_min,
            max: limits.chromosome_bits_max,
        });
    }

    for (name, value) in [
        ("Production budget", req.production_budget),
        ("Marketing budget", req.marketing_budget),
        ("Logistics budget", req.logistics_budget),
        ("Shelf space", req.shelf_space_limit),
    ] {
        if !value.is_finite() || value < 0.0 {
            return Err(PreflightError::Budget { name, value });
        }
    }

    let columns = &req.columns;
    for (key, value) in [
        ("name", &columns.name),
        ("price", &columns.price),
        ("cp", &columns.production_cost),
        ("cm", &columns.marketing_cost),
        ("cl", &columns.logistics_cost),
        ("cs", &columns.shelf_cost),
        ("age", &columns.age),
        ("stock", &columns.stock),
        ("shelf", &columns.shelf),
        ("demand", &columns.demand),
    ] {
        let value = value.trim();
        if value.is_empty() || value == "null" {
            return Err(PreflightError::Column(key));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::request;
    use std::path::PathBuf;

    fn limits() -> ValidationLimits {
        ValidationLimits::default()
    }

    #[test]
    fn valid_request_passes() {
        assert_eq!(validate(&request(PathBuf::from("in.csv")), &limits()), Ok(()));
    }

    #[test]
    fn insufficient_shelf_space() {
        let mut req = request(PathBuf::from("in.csv"));
        req.required_shelf_space = 120.0;
        req.shelf_space_limit = 100.0;
        let err = validate(&req, &limits()).unwrap_err();
        assert_eq!(err.kind(), PreflightKind::ShelfSpace);
        assert_eq!(
            err.to_string(),
            "No Space in total shelf space. Required: 120, Available: 100"
        );
    }

    #[test]
    fn shelf_space_is_checked_before_tunables() {
        let mut req = request(PathBuf::from("in.csv"));
        req.required_shelf_space = 500.0;
        req.discount_base = 0.9;
        assert_eq!(validate(&req, &limits()).unwrap_err().kind(), PreflightKind::ShelfSpace);
    }

    #[test]
    fn discount_base_out_of_range() {
        for bad in [0.6, 0.05, f64::NAN] {
            let mut req = request(PathBuf::from("in.csv"));
            req.discount_base = bad;
            let err = validate(&req, &limits()).unwrap_err();
            assert_eq!(err.kind(), PreflightKind::Validation);
            assert!(matches!(err, PreflightError::DiscountBase { .. }));
        }
        let mut edge = request(PathBuf::from("in.csv"));
        edge.discount_base = 0.5;
        assert!(validate(&edge, &limits()).is_ok());
    }

    #[test]
    fn chromosome_bits_out_of_range() {
        let mut req = request(PathBuf::from("in.csv"));
        req.chromosome_bits = 0;
        assert!(matches!(
            validate(&req, &limits()),
            Err(PreflightError::ChromosomeBits { value: 0, .. })
        ));
    }

    #[test]
    fn negative_budget_rejected() {
        let mut req = request(PathBuf::from("in.csv"));
        req.marketing_budget = -1.0;
        assert!(matches!(
            validate(&req, &limits()),
            Err(PreflightError::Budget { name: "Marketing budget", .. })
        ));
    }

    #[test]
    fn null_column_rejected() {
        let mut req = request(PathBuf::from("in.csv"));
        req.columns.demand = "null".into();
        assert_eq!(validate(&req, &limits()), Err(PreflightError::Column("demand")));
    }
}
