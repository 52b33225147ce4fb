// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
//! Depth-first traversal over the memory context tree.
//!
//! The tree is a closed set of node kinds. A [`ContextVisitor`] produces a value at every
//! operator and merges the values of the children of every interior node, so a traversal is
//! a fold parameterized by the visitor's output type (for example an OR over "is any
//! operator revoking"). Children are visited in plan order: pipelines by creation, then
//! drivers, then operators.

use std::sync::Arc;

use crate::runtime::query_context::QueryContext;
use crate::runtime::task_context::{DriverContext, OperatorContext, PipelineContext, TaskContext};

#[derive(Clone)]
pub enum ContextNode {
    Query(Arc<QueryContext>),
    Task(Arc<TaskContext>),
    Pipeline(Arc<PipelineContext>),
    Driver(Arc<DriverContext>),
    Operator(Arc<OperatorContext>),
}

impl ContextNode {
    pub fn children(&self) -> Vec<ContextNode> {
        match self {
            ContextNode::Query(q) => q.task_contexts().into_iter().map(ContextNode::Task).collect(),
            ContextNode::Task(t) => t.pipelines().into_iter().map(ContextNode::Pipeline).collect(),
            ContextNode::Pipeline(p) => p.drivers().into_iter().map(ContextNode::Driver).collect(),
            ContextNode::Driver(d) => d.operators().into_iter().map(ContextNode::Operator).collect(),
            ContextNode::Operator(_) => Vec::new(),
        }
    }
}

pub trait ContextVisitor {
    type Output;

    fn visit_operator(&mut self, operator: &Arc<OperatorContext>) -> Self::Output;

    /// Combine the results of the children of an interior node.
    fn merge(&mut self, results: Vec<Self::Output>) -> Self::Output;
}

pub fn traverse<V: ContextVisitor>(node: &ContextNode, visitor: &mut V) -> V::Output {
    if let ContextNode::Operator(operator) = node {
        return visitor.visit_operator(operator);
    }
    let mut results = Vec::new();
    for child in node.children() {
        results.push(traverse(&child, visitor));
    }
    visitor.merge(results)
}

/// True if any operator has an outstanding revoke request.
pub struct RevokePendingVisitor;

impl ContextVisitor for RevokePendingVisitor {
    type Output = bool;

    fn visit_operator(&mut self, operator: &Arc<OperatorContext>) -> bool {
        operator.is_memory_revoking_requested()
    }

    fn merge(&mut self, results: Vec<bool>) -> bool {
        results.into_iter().any(|r| r)
    }
}

/// Collect operator contexts in plan order.
pub struct OperatorCollector;

impl ContextVisitor for OperatorCollector {
    type Output = Vec<Arc<OperatorContext>>;

    fn visit_operator(&mut self, operator: &Arc<OperatorContext>) -> Self::Output {
        vec![Arc::clone(operator)]
    }

    fn merge(&mut self, results: Vec<Self::Output>) -> Self::Output {
        results.into_iter().flatten().collect()
    }
}
