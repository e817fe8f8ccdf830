use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::environment::EnvironmentName;
use crate::error::{Error, Result};
use crate::naming::{hostname, Hostname, SiteDomain};
use crate::stack::{Import, StackUnit};
use crate::template::{get_att, get_ref, sub, Resource, TemplateParameter};

pub mod acm_cert;
pub use acm_cert::*;
pub mod s3_bucket;
pub use s3_bucket::*;
pub mod cloudfront;
pub use cloudfront::*;
pub mod route53;
pub use route53::*;
