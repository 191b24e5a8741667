use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Runtime configuration for the orchestrator and its worker harnesses.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Interpreter candidates, tried in order until one resolves to an executable.
    pub interpreters: Vec<String>,
    pub ga_script: PathBuf,
    pub aco_script: PathBuf,
    /// Number of lane processes allowed to run at once across all simulations.
    pub pool_size: usize,
    #[serde(with = "humantime_serde")]
    pub progress_grace: Duration,
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub expected_runtime: Duration,
    pub heuristic_progress_cap: f64,
    pub registry_capacity: usize,
    /// How long a terminal record survives before it may be evicted.
    #[serde(with = "humantime_serde")]
    pub retention: Duration,
    pub validation: ValidationLimits,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            interpreters: vec!["python3".into(), "python".into(), "py".into()],
            ga_script: PathBuf::from("GA.py"),
            aco_script: PathBuf::from("ant.py"),
            pool_size: 2,
            progress_grace: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(1),
            expected_runtime: Duration::from_secs(60),
            heuristic_progress_cap: 95.0,
            registry_capacity: 1024,
            retention: Duration::from_secs(3600),
            validation: ValidationLimits::default(),
        }
    }
}

/// Accepted ranges for the tunable algorithm parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationLimits {
    pub discount_base_min: f64,
    pub discount_base_max: f64,
    pub chromosome_bits_min: u32,
    pub chromosome_bits_max: u32,
}

impl Default for ValidationLimits {
    fn default() -> Self {
        Self {
            discount_base_min: 0.1,
            discount_base_max: 0.5,
            chromosome_bits_min: 1,
            chromosome_bits_max: 32,
        }
    }
}

/// One of the two algorithm executions tracked per simulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Lane {
    #[serde(rename = "GA")]
    Ga,
    #[serde(rename = "ACO")]
    Aco,
}

impl Lane {
    pub const ALL: [Lane; 2] = [Lane::Ga, Lane::Aco];

    pub fn tag(self) -> &'static str {
        match self {
            Lane::Ga => "GA",
            Lane::Aco => "ACO",
        }
    }

    /// Match a lane tag as written by the workers, ignoring case.
    pub fn from_tag(tag: &str) -> Option<Lane> {
        if tag.eq_ignore_ascii_case("GA") {
            Some(Lane::Ga)
        } else if tag.eq_ignore_ascii_case("ACO") {
            Some(Lane::Aco)
        } else {
            None
        }
    }
}

impl fmt::Display for Lane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Opaque simulation identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SimulationId(String);

impl SimulationId {
    /// Generate a fresh random 128-bit identifier rendered as hex.
    pub fn generate() -> Self {
        let bytes: [u8; 16] = rand::random();
        Self(bytes.iter().map(|b| format!("{b:02x}")).collect())
    }
}

impl From<&str> for SimulationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for SimulationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OverallStatus {
    Pending,
    Running,
    Completed,
    InvisibleSolution,
    ShelfSpaceError,
    ValidationError,
    Error,
}

impl OverallStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, OverallStatus::Pending | OverallStatus::Running)
    }
}

impl fmt::Display for OverallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OverallStatus::Pending => "PENDING",
            OverallStatus::Running => "RUNNING",
            OverallStatus::Completed => "COMPLETED",
            OverallStatus::InvisibleSolution => "INVISIBLE_SOLUTION",
            OverallStatus::ShelfSpaceError => "SHELF_SPACE_ERROR",
            OverallStatus::ValidationError => "VALIDATION_ERROR",
            OverallStatus::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// The two terminal states reachable before any lane starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreflightKind {
    ShelfSpace,
    Validation,
}

impl PreflightKind {
    pub fn status(self) -> OverallStatus {
        match self {
            PreflightKind::ShelfSpace => OverallStatus::ShelfSpaceError,
            PreflightKind::Validation => OverallStatus::ValidationError,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LaneStatus {
    pub progress_percent: f64,
    pub eta_seconds: f64,
    pub finished: bool,
    pub has_error: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProductResult {
    pub name: String,
    pub quantity: i64,
    pub price: f64,
    pub unit_cost: f64,
    pub profit_per_unit: f64,
    pub total_profit: f64,
    pub total_cost: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LaneResult {
    pub total_profit: f64,
    pub product_count: usize,
    pub products: Vec<ProductResult>,
}

impl LaneResult {
    /// Build a result from a worker payload, defaulting every missing or
    /// mistyped field to zero/empty.
    pub fn from_json(root: &serde_json::Value) -> Self {
        let products: Vec<ProductResult> = root
            .get("products")
            .and_then(|v| v.as_array())
            .map(|items| items.iter().map(product_from_json).collect())
            .unwrap_or_default();
        Self {
            total_profit: number(root, "total_profit"),
            product_count: products.len(),
            products,
        }
    }
}

fn number(node: &serde_json::Value, key: &str) -> f64 {
    node.get(key).and_then(|v| v.as_f64()).unwrap_or(0.0)
}

fn product_from_json(node: &serde_json::Value) -> ProductResult {
    ProductResult {
        name: node
            .get("name")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        quantity: node
            .get("quantity")
            .and_then(|v| v.as_i64().or_else(|| v.as_f64().map(|f| f as i64)))
            .unwrap_or(0),
        price: number(node, "price"),
        unit_cost: number(node, "unit_cost"),
        profit_per_unit: number(node, "profit_per_unit"),
        total_profit: number(node, "total_profit"),
        total_cost: number(node, "total_cost"),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CombinedResult {
    pub ga: Option<LaneResult>,
    pub aco: Option<LaneResult>,
}

impl CombinedResult {
    pub fn lane(&self, lane: Lane) -> Option<&LaneResult> {
        match lane {
            Lane::Ga => self.ga.as_ref(),
            Lane::Aco => self.aco.as_ref(),
        }
    }

    pub fn set_lane(&mut self, lane: Lane, result: LaneResult) {
        match lane {
            Lane::Ga => self.ga = Some(result),
            Lane::Aco => self.aco = Some(result),
        }
    }
}

/// Aggregate status of one simulation, as seen by pollers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationStatus {
    pub id: SimulationId,
    pub overall_status: OverallStatus,
    pub ga: LaneStatus,
    pub aco: LaneStatus,
    /// Published only once both lanes have finished.
    pub result: Option<CombinedResult>,
    pub error_message: Option<String>,
    #[serde(default)]
    pub created_at_utc: String,
    /// Per-lane payloads collected while the other lane is still running.
    #[serde(skip)]
    pub lane_results: CombinedResult,
}

impl SimulationStatus {
    pub fn new(id: SimulationId) -> Self {
        Self {
            id,
            overall_status: OverallStatus::Pending,
            ga: LaneStatus::default(),
            aco: LaneStatus::default(),
            result: None,
            error_message: None,
            lane_results: CombinedResult::default(),
            created_at_utc: time::OffsetDateTime::now_utc()
                .format(&time::format_description::well_known::Rfc3339)
                .unwrap_or_else(|_| "now".into()),
        }
    }

    pub fn lane(&self, lane: Lane) -> &LaneStatus {
        match lane {
            Lane::Ga => &self.ga,
            Lane::Aco => &self.aco,
        }
    }

    pub fn lane_mut(&mut self, lane: Lane) -> &mut LaneStatus {
        match lane {
            Lane::Ga => &mut self.ga,
            Lane::Aco => &mut self.aco,
        }
    }

    pub fn both_finished(&self) -> bool {
        self.ga.finished && self.aco.finished
    }

    pub fn is_terminal(&self) -> bool {
        self.overall_status.is_terminal()
    }
}

/// Column-name overrides passed through to the workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnMapping {
    pub name: String,
    pub price: String,
    pub production_cost: String,
    pub marketing_cost: String,
    pub logistics_cost: String,
    pub shelf_cost: String,
    pub age: String,
    pub stock: String,
    pub shelf: String,
    pub demand: String,
}

impl ColumnMapping {
    /// Worker flag and value for every mapped column.
    pub fn flags(&self) -> [(&'static str, &str); 10] {
        [
            ("--col_name", &self.name),
            ("--col_price", &self.price),
            ("--col_cp", &self.production_cost),
            ("--col_cm", &self.marketing_cost),
            ("--col_cl", &self.logistics_cost),
            ("--col_shelf_cost", &self.shelf_cost),
            ("--col_age", &self.age),
            ("--col_stock", &self.stock),
            ("--col_shelf", &self.shelf),
            ("--col_demand", &self.demand),
        ]
    }
}

/// One user-submitted optimization request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationRequest {
    pub input_path: PathBuf,
    pub production_budget: f64,
    pub marketing_budget: f64,
    pub logistics_budget: f64,
    pub discount_base: f64,
    pub shelf_space_limit: f64,
    /// Total shelf space the input products need, measured by the caller.
    pub required_shelf_space: f64,
    pub chromosome_bits: u32,
    pub columns: ColumnMapping,
}

impl SimulationRequest {
    /// Worker command-line arguments for one lane. Only the GA lane takes
    /// `--chromosome_bits`.
    pub fn worker_args(&self, lane: Lane) -> Vec<String> {
        let mut args = vec![
            self.input_path.display().to_string(),
            "--bp".into(),
            self.production_budget.to_string(),
            "--bm".into(),
            self.marketing_budget.to_string(),
            "--bl".into(),
            self.logistics_budget.to_string(),
            "--s_max".into(),
            self.shelf_space_limit.to_string(),
            "--d_base".into(),
            self.discount_base.to_string(),
        ];
        if lane == Lane::Ga {
            args.push("--chromosome_bits".into());
            args.push(self.chromosome_bits.to_string());
        }
        for (flag, value) in self.columns.flags() {
            args.push(flag.into());
            args.push(value.into());
        }
        args
    }
}

/// Events emitted by a lane and applied to its simulation's record.
#[derive(Debug, Clone)]
pub enum LaneEvent {
    Progress { lane: Lane, percent: f64, eta_seconds: f64 },
    Result { lane: Lane, result: Box<LaneResult> },
    Error { lane: Lane, message: String },
}

impl LaneEvent {
    pub fn lane(&self) -> Lane {
        match self {
            LaneEvent::Progress { lane, .. }
            | LaneEvent::Result { lane, .. }
            | LaneEvent::Error { lane, .. } => *lane,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, LaneEvent::Progress { .. })
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn columns() -> ColumnMapping {
        ColumnMapping {
            name: "Product".into(),
            price: "Price".into(),
            production_cost: "Cp".into(),
            marketing_cost: "Cm".into(),
            logistics_cost: "Cl".into(),
            shelf_cost: "Cs".into(),
            age: "Age".into(),
            stock: "Stock".into(),
            shelf: "Shelf".into(),
            demand: "Demand".into(),
        }
    }

    pub fn request(input_path: PathBuf) -> SimulationRequest {
        SimulationRequest {
            input_path,
            production_budget: 1000.0,
            marketing_budget: 500.0,
            logistics_budget: 250.0,
            discount_base: 0.3,
            shelf_space_limit: 100.0,
            required_shelf_space: 80.0,
            chromosome_bits: 8,
            columns: columns(),
        }
    }

    pub fn lane_result(total_profit: f64) -> LaneResult {
        LaneResult {
            total_profit,
            ..Default::default()
        }
    }
}
