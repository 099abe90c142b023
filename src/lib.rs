#![doc = include_str!("../README.md")]
#![warn(rustdoc::all)]
#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![deny(unused_must_use, rust_2018_idioms)]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

#[macro_use]
extern crate tracing;

pub mod error;
pub use error::{BuildError, PathIoError, Result};

pub mod fs;
pub use fs::{DiskDirectory, Directory, EnvDirectory, MappedDirectory, VirtualDirectory};

pub mod graph;
pub use graph::{ActionId, ArtifactId, Context, Graph, RuleId, TestId};

pub mod command;
pub use command::{Arg, Command, CommandContext, EnvDefault};

pub mod state;
pub use state::{ActionState, ArtifactState, StateMap};

pub mod builder;
pub use builder::{Builder, TestOutcome};

pub mod runner;
pub use runner::{ActionRequest, ActionRunner, ExecutionRunner};

pub mod cache;
pub use cache::{ActionCache, CachingRunner};

pub mod persist;

pub mod report;
pub use report::{ConsoleReporter, NullReporter, Reporter};

pub mod utils;
