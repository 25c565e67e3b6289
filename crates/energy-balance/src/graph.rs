use crate::{BalanceError, Result};
use device_registry::{DeviceId, DeviceRole};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Declared flow from a provider to a consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub from: DeviceId,
    pub to: DeviceId,
    pub kw: f64,
}

/// What the graph needs to know about a device when wiring it.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub id: DeviceId,
    pub role: DeviceRole,
    /// Present-value kW, if known.
    pub kw: Option<f64>,
}

/// Operator-declared distribution plan. At most one edge per ordered pair.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionGraph {
    edges: Vec<Edge>,
}

impl ConnectionGraph {
    pub fn from_edges(edges: Vec<Edge>) -> Self {
        Self { edges }
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn get(&self, from: &DeviceId, to: &DeviceId) -> Option<&Edge> {
        self.edges.iter().find(|e| &e.from == from && &e.to == to)
    }

    /// kW already promised out of `from`.
    pub fn assigned_from(&self, from: &DeviceId) -> f64 {
        self.edges.iter().filter(|e| &e.from == from).map(|e| e.kw).sum()
    }

    pub fn has_incoming(&self, to: &DeviceId) -> bool {
        self.edges.iter().any(|e| &e.to == to)
    }

    /// Σ kW over every edge.
    pub fn total_kw(&self) -> f64 {
        self.edges.iter().map(|e| e.kw).sum()
    }

    /// Supply of `from` not yet promised to anyone. Unknown supply counts as 0.
    pub fn remaining(&self, from: &Endpoint) -> f64 {
        from.kw.unwrap_or(0.0) - self.assigned_from(&from.id)
    }

    /// Wire `from` to `to`, sizing the edge to
    /// `max(0, min(consumer kW, provider's remaining supply))`.
    pub fn add_edge(&mut self, from: &Endpoint, to: &Endpoint) -> Result<Edge> {
        if from.id == to.id {
            return Err(BalanceError::Validation(format!("{} cannot feed itself", from.id)));
        }
        if from.role != DeviceRole::Provider {
            return Err(BalanceError::Validation(format!("{} is not a provider", from.id)));
        }
        if to.role != DeviceRole::Consumer {
            return Err(BalanceError::Validation(format!("{} is not a consumer", to.id)));
        }
        if self.get(&from.id, &to.id).is_some() {
            return Err(BalanceError::Validation(format!("{} -> {} already exists", from.id, to.id)));
        }
        let kw = to.kw.unwrap_or(0.0).min(self.remaining(from)).max(0.0);
        let edge = Edge {
            from: from.id.clone(),
            to: to.id.clone(),
            kw,
        };
        self.edges.push(edge.clone());
        Ok(edge)
    }

    /// Operator override of an edge's kW.
    pub fn edit_edge(&mut self, from: &DeviceId, to: &DeviceId, kw: f64) -> Result<()> {
        if !kw.is_finite() || kw < 0.0 {
            return Err(BalanceError::Validation(format!("edge kW must be a finite number >= 0, got {kw}")));
        }
        let edge = self
            .edges
            .iter_mut()
            .find(|e| &e.from == from && &e.to == to)
            .ok_or_else(|| BalanceError::UnknownEdge {
                from: from.clone(),
                to: to.clone(),
            })?;
        edge.kw = kw;
        Ok(())
    }

    pub fn remove_edge(&mut self, from: &DeviceId, to: &DeviceId) -> Result<Edge> {
        let idx = self
            .edges
            .iter()
            .position(|e| &e.from == from && &e.to == to)
            .ok_or_else(|| BalanceError::UnknownEdge {
                from: from.clone(),
                to: to.clone(),
            })?;
        Ok(self.edges.remove(idx))
    }

    /// Drop edges touching unknown devices and collapse duplicate pairs to
    /// their first occurrence. Returns true if anything changed.
    pub fn normalize(&mut self, known: &HashSet<DeviceId>) -> bool {
        let before = self.edges.len();
        let mut seen = HashSet::new();
        self.edges.retain(|e| {
            known.contains(&e.from) && known.contains(&e.to) && seen.insert((e.from.clone(), e.to.clone()))
        });
        self.edges.len() != before
    }

    /// Connect every consumer lacking an incoming edge to the provider with the
    /// most remaining supply. Returns the edges created.
    pub fn auto_connect(&mut self, providers: &[Endpoint], consumers: &[Endpoint]) -> Vec<Edge> {
        let mut added = Vec::new();
        for consumer in consumers {
            if consumer.role != DeviceRole::Consumer || self.has_incoming(&consumer.id) {
                continue;
            }
            let best = providers
                .iter()
                .filter(|p| p.role == DeviceRole::Provider && p.id != consumer.id)
                .max_by(|a, b| self.remaining(a).total_cmp(&self.remaining(b)));
            let Some(provider) = best else {
                break;
            };
            if let Ok(edge) = self.add_edge(provider, consumer) {
                added.push(edge);
            }
        }
        added
    }
}
