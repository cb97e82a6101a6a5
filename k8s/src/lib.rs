#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod cluster;
mod lb;
pub mod proxy;

pub use self::cluster::{load_balancer_ingress, Cluster, KubeCluster};
pub use self::lb::await_load_balancer;

pub use k8s_openapi::{
    api::{
        apps::v1::{Deployment, DeploymentSpec},
        core::v1::{
            Container, EnvVar, PodSpec, PodTemplateSpec, Service, ServicePort, ServiceSpec,
        },
    },
    apimachinery::pkg::{
        apis::meta::v1::{LabelSelector, OwnerReference},
        util::intstr::IntOrString,
    },
};
pub use kube::{
    api::{Api, DeleteParams, ObjectMeta, PostParams},
    Client, ResourceExt,
};
