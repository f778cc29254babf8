pub mod error;
pub mod middleware;
pub mod routes;

pub type DeploymentImpl = forge_core_local_deployment::LocalDeployment;
