//! Command router: named sub-operations over a JSON argument bag

use crate::migration::migrator::{
    ApplyOptions, CleanOptions, CleanReport, GenerateReport, LifecycleReport, Migrator,
    RollbackOptions, SquashOptions,
};
use crate::migration::plan::{ApplyTarget, RollbackSelector};
use crate::migration::status::{MigrationStatus, VerifyReport};
use crate::migration::{BatchId, HistoryEntry, MigrationError, Version};
use serde::Serialize;
use serde_json::{Map, Value};

/// JSON type an argument must have
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArgKind {
    String,
    Integer,
    Boolean,
    /// String or non-negative integer version token
    Version,
    /// Non-negative integer or `"last"`
    Batch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ArgSpec {
    pub name: &'static str,
    pub kind: ArgKind,
    pub required: bool,
    pub description: &'static str,
}

const fn arg(
    name: &'static str,
    kind: ArgKind,
    required: bool,
    description: &'static str,
) -> ArgSpec {
    ArgSpec {
        name,
        kind,
        required,
        description,
    }
}

const DRY_RUN: ArgSpec = arg("dry_run", ArgKind::Boolean, false, "Plan and gate without executing");
const OVERRIDE: ArgSpec = arg(
    "override",
    ArgKind::Boolean,
    false,
    "Execute even when the safety gate blocks",
);

/// Route metadata, used for dispatch and help rendering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Route {
    pub name: &'static str,
    pub aliases: &'static [&'static str],
    pub description: &'static str,
    pub args: &'static [ArgSpec],
}

impl Route {
    /// Whether arguments are validated against a schema
    #[must_use]
    pub fn has_schema(&self) -> bool {
        !self.args.is_empty()
    }

    fn answers_to(&self, name: &str) -> bool {
        self.name == name || self.aliases.contains(&name)
    }
}

pub const ROUTES: &[Route] = &[
    Route {
        name: "generate",
        aliases: &[],
        description: "Create a new migration artifact",
        args: &[arg("name", ArgKind::String, true, "Lowercase snake_case migration name")],
    },
    Route {
        name: "status",
        aliases: &[],
        description: "Show applied, pending, drifted and orphaned migrations",
        args: &[],
    },
    Route {
        name: "apply",
        aliases: &["promote", "up"],
        description: "Apply pending migrations in version order",
        args: &[
            arg("target", ArgKind::Version, false, "Stop after this version"),
            DRY_RUN,
            OVERRIDE,
        ],
    },
    Route {
        name: "rollback",
        aliases: &["down"],
        description: "Roll back the most recent migrations",
        args: &[
            arg("steps", ArgKind::Integer, false, "Number of migrations to roll back"),
            arg("batch", ArgKind::Batch, false, "Roll back one batch, or \"last\""),
            arg("force", ArgKind::Boolean, false, "Allow rolling back beyond the grace period"),
            DRY_RUN,
            OVERRIDE,
        ],
    },
    Route {
        name: "squash",
        aliases: &[],
        description: "Compact an applied range of migrations into one record",
        args: &[
            arg("from", ArgKind::Version, true, "First version of the range"),
            arg("to", ArgKind::Version, true, "Last version of the range"),
            DRY_RUN,
            OVERRIDE,
        ],
    },
    Route {
        name: "history",
        aliases: &["log"],
        description: "Show the ledger of applied, rolled back and squashed migrations",
        args: &[arg("limit", ArgKind::Integer, false, "Show at most this many entries")],
    },
    Route {
        name: "verify",
        aliases: &["validate"],
        description: "Check applied migrations for drift, orphans and gaps",
        args: &[],
    },
    Route {
        name: "clean",
        aliases: &[],
        description: "List orphaned records; prune them or release a stale lock on request",
        args: &[
            arg("force", ArgKind::Boolean, false, "Prune orphaned records"),
            arg("release_lock", ArgKind::Boolean, false, "Force-release the migration lock"),
        ],
    },
];

/// What `help: true` returns instead of executing
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HelpDescriptor {
    pub name: &'static str,
    pub aliases: &'static [&'static str],
    pub description: &'static str,
    pub has_schema: bool,
    pub args: &'static [ArgSpec],
}

impl From<&Route> for HelpDescriptor {
    fn from(route: &Route) -> Self {
        Self {
            name: route.name,
            aliases: route.aliases,
            description: route.description,
            has_schema: route.has_schema(),
            args: route.args,
        }
    }
}

/// Structured result of a dispatched command
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", content = "result", rename_all = "snake_case")]
pub enum CommandOutput {
    Help(HelpDescriptor),
    Generated(GenerateReport),
    Status(MigrationStatus),
    Lifecycle(LifecycleReport),
    History(Vec<HistoryEntry>),
    Verify(VerifyReport),
    Clean(CleanReport),
}

/// Dispatches sub-operation names to a [`Migrator`]
#[derive(Debug)]
pub struct CommandRouter {
    migrator: Migrator,
}

impl CommandRouter {
    #[must_use]
    pub fn new(migrator: Migrator) -> Self {
        Self { migrator }
    }

    #[must_use]
    pub fn migrator(&self) -> &Migrator {
        &self.migrator
    }

    #[must_use]
    pub fn routes(&self) -> &'static [Route] {
        ROUTES
    }

    /// Route for a name or alias
    #[must_use]
    pub fn route(&self, name: &str) -> Option<&'static Route> {
        ROUTES.iter().find(|r| r.answers_to(name))
    }

    /// Validate `args` and run the named sub-operation
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::UnknownCommand` for an unknown name,
    /// `MigrationError::InvalidArgument` for a bad argument bag, or whatever
    /// the sub-operation fails with.
    pub fn dispatch(
        &self,
        name: &str,
        args: &Map<String, Value>,
    ) -> Result<CommandOutput, MigrationError> {
        let route = self
            .route(name)
            .ok_or_else(|| MigrationError::UnknownCommand(name.to_string()))?;

        match args.get("help") {
            None | Some(Value::Bool(false)) => {}
            Some(Value::Bool(true)) => return Ok(CommandOutput::Help(route.into())),
            Some(other) => {
                return Err(MigrationError::InvalidArgument {
                    command: route.name.to_string(),
                    argument: "help".to_string(),
                    reason: format!("expected Boolean, got {other}"),
                })
            }
        }
        let args = Args::validate(route, args)?;
        log::debug!("Dispatching {}", route.name);

        match route.name {
            "generate" => {
                let name = args.string("name").unwrap_or_default();
                self.migrator.generate(&name).map(CommandOutput::Generated)
            }
            "status" => self.migrator.status().map(CommandOutput::Status),
            "apply" => {
                let options = ApplyOptions {
                    target: args
                        .version("target")
                        .map_or(ApplyTarget::Latest, ApplyTarget::Version),
                    dry_run: args.flag("dry_run"),
                    override_safety: args.flag("override"),
                };
                self.migrator.apply(&options).map(CommandOutput::Lifecycle)
            }
            "rollback" => {
                let options = RollbackOptions {
                    selector: args.rollback_selector()?,
                    force: args.flag("force"),
                    dry_run: args.flag("dry_run"),
                    override_safety: args.flag("override"),
                };
                self.migrator.rollback(&options).map(CommandOutput::Lifecycle)
            }
            "squash" => {
                let (Some(from), Some(to)) = (args.version("from"), args.version("to")) else {
                    return Err(args.invalid("from", "both 'from' and 'to' are required"));
                };
                let options = SquashOptions {
                    from,
                    to,
                    dry_run: args.flag("dry_run"),
                    override_safety: args.flag("override"),
                };
                self.migrator.squash(&options).map(CommandOutput::Lifecycle)
            }
            "history" => {
                let limit = args.integer("limit").map(|n| usize::try_from(n).unwrap_or(usize::MAX));
                self.migrator.history(limit).map(CommandOutput::History)
            }
            "verify" => self.migrator.verify().map(CommandOutput::Verify),
            "clean" => self
                .migrator
                .clean(CleanOptions {
                    force: args.flag("force"),
                    release_lock: args.flag("release_lock"),
                })
                .map(CommandOutput::Clean),
            other => Err(MigrationError::UnknownCommand(other.to_string())),
        }
    }
}

/// Argument bag checked against a route's specs
struct Args<'a> {
    command: &'static str,
    values: &'a Map<String, Value>,
}

impl<'a> Args<'a> {
    fn validate(
        route: &'static Route,
        values: &'a Map<String, Value>,
    ) -> Result<Self, MigrationError> {
        let args = Self {
            command: route.name,
            values,
        };

        for (key, value) in values {
            // Checked before validation
            if key == "help" {
                continue;
            }
            let spec = route
                .args
                .iter()
                .find(|s| s.name == key)
                .ok_or_else(|| args.invalid(key, "unknown argument"))?;
            let ok = match spec.kind {
                ArgKind::String => value.is_string(),
                ArgKind::Integer => value.is_u64(),
                ArgKind::Boolean => value.is_boolean(),
                ArgKind::Version => value.as_str().is_some_and(|s| !s.is_empty()) || value.is_u64(),
                ArgKind::Batch => value.is_u64() || value.as_str() == Some("last"),
            };
            if !ok {
                return Err(args.invalid(key, &format!("expected {:?}, got {}", spec.kind, value)));
            }
        }

        if let Some(missing) = route
            .args
            .iter()
            .find(|s| s.required && !values.contains_key(s.name))
        {
            return Err(args.invalid(missing.name, "required argument is missing"));
        }
        Ok(args)
    }

    fn invalid(&self, argument: &str, reason: &str) -> MigrationError {
        MigrationError::InvalidArgument {
            command: self.command.to_string(),
            argument: argument.to_string(),
            reason: reason.to_string(),
        }
    }

    fn flag(&self, name: &str) -> bool {
        self.values.get(name).and_then(Value::as_bool).unwrap_or(false)
    }

    fn string(&self, name: &str) -> Option<String> {
        self.values.get(name).and_then(Value::as_str).map(str::to_string)
    }

    fn integer(&self, name: &str) -> Option<u64> {
        self.values.get(name).and_then(Value::as_u64)
    }

    fn version(&self, name: &str) -> Option<Version> {
        match self.values.get(name)? {
            Value::String(s) => Some(Version::new(s.clone())),
            Value::Number(n) => Some(Version::new(n.to_string())),
            _ => None,
        }
    }

    fn rollback_selector(&self) -> Result<Option<RollbackSelector>, MigrationError> {
        match (self.integer("steps"), self.values.get("batch")) {
            (Some(_), Some(_)) => {
                Err(self.invalid("batch", "'steps' and 'batch' are mutually exclusive"))
            }
            (Some(0), None) => Err(self.invalid("steps", "must be at least 1")),
            (Some(n), None) => Ok(Some(RollbackSelector::Steps(
                usize::try_from(n).unwrap_or(usize::MAX),
            ))),
            (None, Some(Value::String(_))) => Ok(Some(RollbackSelector::LastBatch)),
            (None, Some(batch)) => Ok(batch.as_u64().map(|b| RollbackSelector::Batch(BatchId(b)))),
            (None, None) => Ok(None),
        }
    }
}
