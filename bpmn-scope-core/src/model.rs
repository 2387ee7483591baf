//! Executable process model: element metadata the engine reads while
//! advancing instances.
//!
//! Models are produced either by [`ProcessBuilder`] or from YAML via
//! [`ProcessModel::from_yaml_str`]. Both paths run the same structural
//! validation in [`ProcessBuilder::build`].

use crate::types::BpmnElementType;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

// ─── Element metadata ─────────────────────────────────────────

/// How a message subscription derives its correlation key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrelationKey {
    Static(String),
    /// Read from the variable with this name, visible from the subscribing scope.
    Variable(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventDefinition {
    Message {
        name: String,
        correlation_key: CorrelationKey,
    },
    Timer {
        duration_ms: u64,
    },
}

/// Multi-instance marker. The cardinality is fixed by the model.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiInstanceSpec {
    #[serde(default)]
    pub sequential: bool,
    pub cardinality: u32,
}

/// Variable mapping `source -> target`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mapping {
    pub source: String,
    pub target: String,
}

/// Sequence flow condition: the variable must be visible and either equal
/// `equals`, or be truthy when `equals` is absent.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub variable: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub equals: Option<serde_json::Value>,
}

impl Condition {
    pub fn holds(&self, value: Option<&serde_json::Value>) -> bool {
        use serde_json::Value;
        match (value, &self.equals) {
            (None, _) => false,
            (Some(v), Some(expected)) => v == expected,
            (Some(Value::Bool(b)), None) => *b,
            (Some(Value::Null), None) => false,
            (Some(Value::Number(n)), None) => n.as_f64().is_some_and(|f| f != 0.0),
            (Some(Value::String(s)), None) => !s.is_empty(),
            (Some(_), None) => true,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ElementDef {
    pub id: String,
    pub element_type: BpmnElementType,
    /// Enclosing scope element id. `None` only for the process element.
    pub flow_scope: Option<String>,
    #[serde(default)]
    pub incoming: Vec<String>,
    #[serde(default)]
    pub outgoing: Vec<String>,
    /// Sequence flows only.
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub condition: Option<Condition>,
    /// Exclusive gateways only.
    #[serde(default)]
    pub default_flow: Option<String>,
    #[serde(default)]
    pub event: Option<EventDefinition>,
    #[serde(default = "default_true")]
    pub interrupting: bool,
    #[serde(default)]
    pub attached_to: Option<String>,
    #[serde(default)]
    pub multi_instance: Option<MultiInstanceSpec>,
    #[serde(default)]
    pub job_type: Option<String>,
    #[serde(default)]
    pub called_process_id: Option<String>,
    #[serde(default)]
    pub input_mappings: Vec<Mapping>,
    #[serde(default)]
    pub output_mappings: Vec<Mapping>,
    /// Derived: the element is the target of a flow leaving an event-based gateway.
    #[serde(default)]
    pub connected_to_event_based_gateway: bool,
}

fn default_true() -> bool {
    true
}

impl ElementDef {
    pub fn new(id: impl Into<String>, element_type: BpmnElementType) -> Self {
        Self {
            id: id.into(),
            element_type,
            flow_scope: None,
            incoming: Vec::new(),
            outgoing: Vec::new(),
            source: None,
            target: None,
            condition: None,
            default_flow: None,
            event: None,
            interrupting: true,
            attached_to: None,
            multi_instance: None,
            job_type: None,
            called_process_id: None,
            input_mappings: Vec::new(),
            output_mappings: Vec::new(),
            connected_to_event_based_gateway: false,
        }
    }

    pub fn in_scope(mut self, scope: impl Into<String>) -> Self {
        self.flow_scope = Some(scope.into());
        self
    }

    pub fn job_type(mut self, job_type: impl Into<String>) -> Self {
        self.job_type = Some(job_type.into());
        self
    }

    pub fn message(mut self, name: impl Into<String>, correlation_key: CorrelationKey) -> Self {
        self.event = Some(EventDefinition::Message {
            name: name.into(),
            correlation_key,
        });
        self
    }

    pub fn timer(mut self, duration_ms: u64) -> Self {
        self.event = Some(EventDefinition::Timer { duration_ms });
        self
    }

    pub fn non_interrupting(mut self) -> Self {
        self.interrupting = false;
        self
    }

    pub fn attached_to(mut self, activity: impl Into<String>) -> Self {
        self.attached_to = Some(activity.into());
        self
    }

    pub fn multi_instance(mut self, sequential: bool, cardinality: u32) -> Self {
        self.multi_instance = Some(MultiInstanceSpec {
            sequential,
            cardinality,
        });
        self
    }

    pub fn called_process(mut self, process_id: impl Into<String>) -> Self {
        self.called_process_id = Some(process_id.into());
        self
    }

    pub fn input(mut self, source: impl Into<String>, target: impl Into<String>) -> Self {
        self.input_mappings.push(Mapping {
            source: source.into(),
            target: target.into(),
        });
        self
    }

    pub fn output(mut self, source: impl Into<String>, target: impl Into<String>) -> Self {
        self.output_mappings.push(Mapping {
            source: source.into(),
            target: target.into(),
        });
        self
    }

    pub fn is_multi_instance(&self) -> bool {
        self.multi_instance.is_some()
    }
}

// ─── Model errors ─────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ModelError {
    #[error("process id must not be blank")]
    BlankProcessId,
    #[error("duplicate element id '{0}'")]
    DuplicateElement(String),
    #[error("element '{element}' references unknown flow scope '{scope}'")]
    UnknownFlowScope { element: String, scope: String },
    #[error("element '{element}' has flow scope '{scope}' which cannot contain elements")]
    NotAContainer { element: String, scope: String },
    #[error("sequence flow '{flow}' references unknown element '{endpoint}'")]
    UnknownFlowEndpoint { flow: String, endpoint: String },
    #[error("sequence flow '{flow}' connects elements of different flow scopes")]
    FlowCrossesScope { flow: String },
    #[error("boundary event '{0}' is not attached to an activity")]
    BoundaryNotAttached(String),
    #[error("element '{0}' requires an event definition")]
    MissingEventDefinition(String),
    #[error("service task '{0}' requires a job type")]
    MissingJobType(String),
    #[error("call activity '{0}' requires a called process id")]
    MissingCalledProcess(String),
    #[error("event sub-process '{0}' requires a start event with an event definition")]
    EventSubProcessWithoutStart(String),
    #[error("default flow '{flow}' of gateway '{gateway}' is not one of its outgoing flows")]
    InvalidDefaultFlow { gateway: String, flow: String },
}

// ─── Process model ────────────────────────────────────────────

/// Validated element set of one process.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProcessModel {
    pub bpmn_process_id: String,
    pub elements: BTreeMap<String, ElementDef>,
}

impl ProcessModel {
    pub fn element(&self, id: &str) -> Option<&ElementDef> {
        self.elements.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.elements.contains_key(id)
    }

    /// Static flow-scope chain of an element, nearest first, ending with the
    /// process element. Empty for the process itself or unknown ids.
    pub fn flow_scope_chain(&self, id: &str) -> Vec<&ElementDef> {
        let mut chain = Vec::new();
        let mut current = self.element(id).and_then(|e| e.flow_scope.as_deref());
        while let Some(scope_id) = current {
            match self.element(scope_id) {
                Some(scope) => {
                    chain.push(scope);
                    current = scope.flow_scope.as_deref();
                }
                None => break,
            }
        }
        chain
    }

    /// True when `ancestor` is a strict static flow-scope ancestor of `element`.
    pub fn is_flow_scope_ancestor(&self, ancestor: &str, element: &str) -> bool {
        self.flow_scope_chain(element)
            .iter()
            .any(|scope| scope.id == ancestor)
    }

    /// Direct children of a scope element, in id order.
    pub fn children_of(&self, scope_id: &str) -> Vec<&ElementDef> {
        self.elements
            .values()
            .filter(|e| e.flow_scope.as_deref() == Some(scope_id))
            .collect()
    }

    /// The none start event a scope starts from on normal activation.
    pub fn none_start_event(&self, scope_id: &str) -> Option<&ElementDef> {
        self.children_of(scope_id)
            .into_iter()
            .find(|e| e.element_type == BpmnElementType::StartEvent && e.event.is_none())
    }

    /// The triggered start event of an event sub-process.
    pub fn event_start_event(&self, event_sub_process_id: &str) -> Option<&ElementDef> {
        self.children_of(event_sub_process_id)
            .into_iter()
            .find(|e| e.element_type == BpmnElementType::StartEvent && e.event.is_some())
    }

    /// Start events of all event sub-processes directly inside a scope.
    pub fn event_sub_process_starts(&self, scope_id: &str) -> Vec<&ElementDef> {
        self.children_of(scope_id)
            .into_iter()
            .filter(|e| e.element_type == BpmnElementType::EventSubProcess)
            .filter_map(|esp| self.event_start_event(&esp.id))
            .collect()
    }

    pub fn boundary_events(&self, activity_id: &str) -> Vec<&ElementDef> {
        self.elements
            .values()
            .filter(|e| {
                e.element_type == BpmnElementType::BoundaryEvent
                    && e.attached_to.as_deref() == Some(activity_id)
            })
            .collect()
    }

    /// Targets of the outgoing flows of an event-based gateway.
    pub fn gateway_events(&self, gateway_id: &str) -> Vec<&ElementDef> {
        self.element(gateway_id)
            .map(|g| {
                g.outgoing
                    .iter()
                    .filter_map(|flow| self.element(flow))
                    .filter_map(|flow| flow.target.as_deref())
                    .filter_map(|target| self.element(target))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Parse and validate a model from YAML.
    ///
    /// ```yaml
    /// id: order
    /// elements:
    ///   - { id: start, type: START_EVENT }
    ///   - { id: review, type: USER_TASK }
    ///   - { id: end, type: END_EVENT }
    /// flows:
    ///   - { source: start, target: review }
    ///   - { source: review, target: end }
    /// ```
    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let raw: ProcessYaml = serde_yaml::from_str(yaml)?;
        let mut builder = ProcessBuilder::new(raw.id);
        for element in raw.elements {
            let mut def = ElementDef::new(element.id, element.element_type);
            def.flow_scope = element.flow_scope;
            def.event = match (element.message, element.timer_ms) {
                (Some(message), _) => Some(EventDefinition::Message {
                    name: message.name,
                    correlation_key: message.correlation_key,
                }),
                (None, Some(duration_ms)) => Some(EventDefinition::Timer { duration_ms }),
                (None, None) => None,
            };
            def.interrupting = element.interrupting;
            def.attached_to = element.attached_to;
            def.multi_instance = element.multi_instance;
            def.job_type = element.job_type;
            def.called_process_id = element.called_process_id;
            def.input_mappings = element.input_mappings;
            def.output_mappings = element.output_mappings;
            def.default_flow = element.default_flow;
            builder = builder.element(def);
        }
        for flow in raw.flows {
            let id = flow
                .id
                .unwrap_or_else(|| default_flow_id(&flow.source, &flow.target));
            builder = builder.add_flow(id, flow.source, flow.target, flow.condition);
        }
        Ok(builder.build()?)
    }
}

// ── YAML format for deserialization ──

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ProcessYaml {
    id: String,
    #[serde(default)]
    elements: Vec<ElementYaml>,
    #[serde(default)]
    flows: Vec<FlowYaml>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ElementYaml {
    id: String,
    #[serde(rename = "type")]
    element_type: BpmnElementType,
    #[serde(default)]
    flow_scope: Option<String>,
    #[serde(default)]
    message: Option<MessageYaml>,
    #[serde(default)]
    timer_ms: Option<u64>,
    #[serde(default = "default_true")]
    interrupting: bool,
    #[serde(default)]
    attached_to: Option<String>,
    #[serde(default)]
    multi_instance: Option<MultiInstanceSpec>,
    #[serde(default)]
    job_type: Option<String>,
    #[serde(default)]
    called_process_id: Option<String>,
    #[serde(default)]
    input_mappings: Vec<Mapping>,
    #[serde(default)]
    output_mappings: Vec<Mapping>,
    #[serde(default)]
    default_flow: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct MessageYaml {
    name: String,
    correlation_key: CorrelationKey,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FlowYaml {
    #[serde(default)]
    id: Option<String>,
    source: String,
    target: String,
    #[serde(default)]
    condition: Option<Condition>,
}

fn default_flow_id(source: &str, target: &str) -> String {
    format!("{source}_to_{target}")
}

// ─── Builder ──────────────────────────────────────────────────

struct FlowSpec {
    id: String,
    source: String,
    target: String,
    condition: Option<Condition>,
}

/// Fluent construction of a [`ProcessModel`].
///
/// Elements added inside [`ProcessBuilder::sub_process`] or
/// [`ProcessBuilder::event_sub_process`] closures get that scope as flow scope.
pub struct ProcessBuilder {
    process_id: String,
    elements: Vec<ElementDef>,
    flows: Vec<FlowSpec>,
    defaults: Vec<(String, String)>,
    scope_stack: Vec<String>,
}

impl ProcessBuilder {
    pub fn new(process_id: impl Into<String>) -> Self {
        let process_id = process_id.into();
        Self {
            scope_stack: vec![process_id.clone()],
            process_id,
            elements: Vec::new(),
            flows: Vec::new(),
            defaults: Vec::new(),
        }
    }

    fn current_scope(&self) -> String {
        self.scope_stack
            .last()
            .cloned()
            .unwrap_or_else(|| self.process_id.clone())
    }

    /// Add an element. Without an explicit flow scope it joins the current scope.
    pub fn element(mut self, mut element: ElementDef) -> Self {
        if element.flow_scope.is_none() {
            element.flow_scope = Some(self.current_scope());
        }
        self.elements.push(element);
        self
    }

    pub fn start_event(self, id: &str) -> Self {
        self.element(ElementDef::new(id, BpmnElementType::StartEvent))
    }

    pub fn message_start_event(self, id: &str, name: &str, key: CorrelationKey) -> Self {
        self.element(ElementDef::new(id, BpmnElementType::StartEvent).message(name, key))
    }

    pub fn timer_start_event(self, id: &str, duration_ms: u64) -> Self {
        self.element(ElementDef::new(id, BpmnElementType::StartEvent).timer(duration_ms))
    }

    pub fn end_event(self, id: &str) -> Self {
        self.element(ElementDef::new(id, BpmnElementType::EndEvent))
    }

    pub fn task(self, id: &str) -> Self {
        self.element(ElementDef::new(id, BpmnElementType::Task))
    }

    pub fn user_task(self, id: &str) -> Self {
        self.element(ElementDef::new(id, BpmnElementType::UserTask))
    }

    pub fn service_task(self, id: &str, job_type: &str) -> Self {
        self.element(ElementDef::new(id, BpmnElementType::ServiceTask).job_type(job_type))
    }

    pub fn receive_task(self, id: &str, message: &str, key: CorrelationKey) -> Self {
        self.element(ElementDef::new(id, BpmnElementType::ReceiveTask).message(message, key))
    }

    pub fn message_catch_event(self, id: &str, message: &str, key: CorrelationKey) -> Self {
        self.element(
            ElementDef::new(id, BpmnElementType::IntermediateCatchEvent).message(message, key),
        )
    }

    pub fn timer_catch_event(self, id: &str, duration_ms: u64) -> Self {
        self.element(
            ElementDef::new(id, BpmnElementType::IntermediateCatchEvent).timer(duration_ms),
        )
    }

    pub fn exclusive_gateway(self, id: &str) -> Self {
        self.element(ElementDef::new(id, BpmnElementType::ExclusiveGateway))
    }

    pub fn parallel_gateway(self, id: &str) -> Self {
        self.element(ElementDef::new(id, BpmnElementType::ParallelGateway))
    }

    pub fn event_based_gateway(self, id: &str) -> Self {
        self.element(ElementDef::new(id, BpmnElementType::EventBasedGateway))
    }

    pub fn call_activity(self, id: &str, process_id: &str) -> Self {
        self.element(ElementDef::new(id, BpmnElementType::CallActivity).called_process(process_id))
    }

    pub fn boundary_event(self, id: &str, attached_to: &str, event: EventDefinition) -> Self {
        let mut def = ElementDef::new(id, BpmnElementType::BoundaryEvent).attached_to(attached_to);
        def.event = Some(event);
        self.element(def)
    }

    pub fn sub_process(self, id: &str, body: impl FnOnce(Self) -> Self) -> Self {
        self.scoped(ElementDef::new(id, BpmnElementType::SubProcess), body)
    }

    pub fn event_sub_process(
        self,
        id: &str,
        interrupting: bool,
        body: impl FnOnce(Self) -> Self,
    ) -> Self {
        let mut def = ElementDef::new(id, BpmnElementType::EventSubProcess);
        def.interrupting = interrupting;
        self.scoped(def, body)
    }

    /// Add a container element and build its content in the closure.
    pub fn scoped(self, container: ElementDef, body: impl FnOnce(Self) -> Self) -> Self {
        let scope_id = container.id.clone();
        let mut builder = self.element(container);
        builder.scope_stack.push(scope_id);
        let mut builder = body(builder);
        builder.scope_stack.pop();
        builder
    }

    /// Modify the most recently added element.
    pub fn with(mut self, f: impl FnOnce(&mut ElementDef)) -> Self {
        if let Some(last) = self.elements.last_mut() {
            f(last);
        }
        self
    }

    fn add_flow(
        mut self,
        id: String,
        source: String,
        target: String,
        condition: Option<Condition>,
    ) -> Self {
        self.flows.push(FlowSpec {
            id,
            source,
            target,
            condition,
        });
        self
    }

    pub fn flow(self, id: &str, source: &str, target: &str) -> Self {
        self.add_flow(id.into(), source.into(), target.into(), None)
    }

    pub fn conditional_flow(self, id: &str, source: &str, target: &str, condition: Condition) -> Self {
        self.add_flow(id.into(), source.into(), target.into(), Some(condition))
    }

    /// Connect two elements with a generated flow id `{source}_to_{target}`.
    pub fn connect(self, source: &str, target: &str) -> Self {
        self.add_flow(default_flow_id(source, target), source.into(), target.into(), None)
    }

    /// Connect each consecutive pair of ids.
    pub fn chain(mut self, ids: &[&str]) -> Self {
        for pair in ids.windows(2) {
            self = self.connect(pair[0], pair[1]);
        }
        self
    }

    pub fn default_flow(mut self, gateway: &str, flow: &str) -> Self {
        self.defaults.push((gateway.into(), flow.into()));
        self
    }

    pub fn build(self) -> Result<ProcessModel, ModelError> {
        if self.process_id.trim().is_empty() {
            return Err(ModelError::BlankProcessId);
        }

        let mut elements: BTreeMap<String, ElementDef> = BTreeMap::new();
        elements.insert(
            self.process_id.clone(),
            ElementDef::new(self.process_id.clone(), BpmnElementType::Process),
        );
        for element in self.elements {
            if elements.contains_key(&element.id) {
                return Err(ModelError::DuplicateElement(element.id));
            }
            elements.insert(element.id.clone(), element);
        }

        // boundary events live in the flow scope of their activity
        let attachments: Vec<(String, Option<String>)> = elements
            .values()
            .filter(|e| e.element_type == BpmnElementType::BoundaryEvent)
            .map(|e| (e.id.clone(), e.attached_to.clone()))
            .collect();
        for (boundary, attached_to) in attachments {
            let activity = attached_to
                .as_deref()
                .and_then(|a| elements.get(a))
                .filter(|a| a.element_type.is_activity())
                .ok_or_else(|| ModelError::BoundaryNotAttached(boundary.clone()))?;
            let scope = activity.flow_scope.clone();
            if let Some(def) = elements.get_mut(&boundary) {
                def.flow_scope = scope;
            }
        }

        for element in elements.values() {
            if let Some(scope) = &element.flow_scope {
                let container = elements.get(scope).ok_or_else(|| ModelError::UnknownFlowScope {
                    element: element.id.clone(),
                    scope: scope.clone(),
                })?;
                if !container.element_type.is_container() {
                    return Err(ModelError::NotAContainer {
                        element: element.id.clone(),
                        scope: scope.clone(),
                    });
                }
            }
        }

        for flow in self.flows {
            if elements.contains_key(&flow.id) {
                return Err(ModelError::DuplicateElement(flow.id));
            }
            let source_scope = elements
                .get(&flow.source)
                .map(|e| e.flow_scope.clone())
                .ok_or_else(|| ModelError::UnknownFlowEndpoint {
                    flow: flow.id.clone(),
                    endpoint: flow.source.clone(),
                })?;
            let target_scope = elements
                .get(&flow.target)
                .map(|e| e.flow_scope.clone())
                .ok_or_else(|| ModelError::UnknownFlowEndpoint {
                    flow: flow.id.clone(),
                    endpoint: flow.target.clone(),
                })?;
            if source_scope != target_scope {
                return Err(ModelError::FlowCrossesScope { flow: flow.id });
            }

            if let Some(source) = elements.get_mut(&flow.source) {
                source.outgoing.push(flow.id.clone());
            }
            if let Some(target) = elements.get_mut(&flow.target) {
                target.incoming.push(flow.id.clone());
            }
            let mut def = ElementDef::new(flow.id.clone(), BpmnElementType::SequenceFlow);
            def.flow_scope = source_scope;
            def.source = Some(flow.source);
            def.target = Some(flow.target);
            def.condition = flow.condition;
            elements.insert(flow.id, def);
        }

        for (gateway, flow) in self.defaults {
            let valid = elements
                .get(&gateway)
                .is_some_and(|g| g.outgoing.contains(&flow));
            if !valid {
                return Err(ModelError::InvalidDefaultFlow { gateway, flow });
            }
            if let Some(g) = elements.get_mut(&gateway) {
                g.default_flow = Some(flow);
            }
        }
        for element in elements.values() {
            if let Some(flow) = &element.default_flow {
                if !element.outgoing.contains(flow) {
                    return Err(ModelError::InvalidDefaultFlow {
                        gateway: element.id.clone(),
                        flow: flow.clone(),
                    });
                }
            }
        }

        let gateway_targets: BTreeSet<String> = elements
            .values()
            .filter(|e| e.element_type == BpmnElementType::SequenceFlow)
            .filter(|flow| {
                flow.source
                    .as_deref()
                    .and_then(|s| elements.get(s))
                    .is_some_and(|s| s.element_type == BpmnElementType::EventBasedGateway)
            })
            .filter_map(|flow| flow.target.clone())
            .collect();
        for target in gateway_targets {
            if let Some(def) = elements.get_mut(&target) {
                def.connected_to_event_based_gateway = true;
            }
        }

        for element in elements.values() {
            validate_element(element, &elements)?;
        }

        Ok(ProcessModel {
            bpmn_process_id: self.process_id,
            elements,
        })
    }
}

fn validate_element(
    element: &ElementDef,
    elements: &BTreeMap<String, ElementDef>,
) -> Result<(), ModelError> {
    match element.element_type {
        BpmnElementType::IntermediateCatchEvent
        | BpmnElementType::ReceiveTask
        | BpmnElementType::BoundaryEvent
            if element.event.is_none() =>
        {
            Err(ModelError::MissingEventDefinition(element.id.clone()))
        }
        BpmnElementType::ReceiveTask
            if !matches!(element.event, Some(EventDefinition::Message { .. })) =>
        {
            Err(ModelError::MissingEventDefinition(element.id.clone()))
        }
        BpmnElementType::ServiceTask if element.job_type.is_none() => {
            Err(ModelError::MissingJobType(element.id.clone()))
        }
        BpmnElementType::CallActivity if element.called_process_id.is_none() => {
            Err(ModelError::MissingCalledProcess(element.id.clone()))
        }
        BpmnElementType::EventSubProcess => {
            let has_start = elements.values().any(|e| {
                e.flow_scope.as_deref() == Some(element.id.as_str())
                    && e.element_type == BpmnElementType::StartEvent
                    && e.event.is_some()
            });
            if has_start {
                Ok(())
            } else {
                Err(ModelError::EventSubProcessWithoutStart(element.id.clone()))
            }
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nested() -> ProcessModel {
        ProcessBuilder::new("process")
            .start_event("start")
            .sub_process("sub", |s| {
                s.start_event("sub_start")
                    .user_task("A")
                    .end_event("sub_end")
                    .chain(&["sub_start", "A", "sub_end"])
            })
            .end_event("end")
            .chain(&["start", "sub", "end"])
            .build()
            .unwrap()
    }

    #[test]
    fn builder_assigns_scopes_and_flows() {
        let model = nested();
        assert_eq!(model.element("A").unwrap().flow_scope.as_deref(), Some("sub"));
        assert_eq!(model.element("sub").unwrap().flow_scope.as_deref(), Some("process"));
        assert_eq!(model.element("start").unwrap().outgoing, vec!["start_to_sub"]);
        let flow = model.element("start_to_sub").unwrap();
        assert_eq!(flow.element_type, BpmnElementType::SequenceFlow);
        assert_eq!(flow.target.as_deref(), Some("sub"));
    }

    #[test]
    fn flow_scope_chain_ends_at_process() {
        let model = nested();
        let chain: Vec<&str> = model
            .flow_scope_chain("A")
            .iter()
            .map(|e| e.id.as_str())
            .collect();
        assert_eq!(chain, vec!["sub", "process"]);
        assert!(model.is_flow_scope_ancestor("process", "A"));
        assert!(!model.is_flow_scope_ancestor("A", "sub"));
    }

    #[test]
    fn flows_must_stay_inside_one_scope() {
        let err = ProcessBuilder::new("p")
            .start_event("start")
            .sub_process("sub", |s| s.user_task("A"))
            .connect("start", "A")
            .build()
            .unwrap_err();
        assert_eq!(
            err,
            ModelError::FlowCrossesScope {
                flow: "start_to_A".into()
            }
        );
    }

    #[test]
    fn event_based_gateway_targets_are_marked() {
        let model = ProcessBuilder::new("p")
            .start_event("start")
            .event_based_gateway("gw")
            .timer_catch_event("timer", 1000)
            .message_catch_event("msg", "ping", CorrelationKey::Static("k".into()))
            .chain(&["start", "gw", "timer"])
            .connect("gw", "msg")
            .build()
            .unwrap();
        assert!(model.element("timer").unwrap().connected_to_event_based_gateway);
        assert!(model.element("msg").unwrap().connected_to_event_based_gateway);
        assert!(!model.element("gw").unwrap().connected_to_event_based_gateway);
        assert_eq!(model.gateway_events("gw").len(), 2);
    }

    #[test]
    fn yaml_model_matches_builder() {
        let yaml = r#"
id: process
elements:
  - { id: start, type: START_EVENT }
  - { id: sub, type: SUB_PROCESS }
  - { id: sub_start, type: START_EVENT, flow_scope: sub }
  - { id: A, type: USER_TASK, flow_scope: sub }
  - { id: sub_end, type: END_EVENT, flow_scope: sub }
  - { id: end, type: END_EVENT }
flows:
  - { source: start, target: sub }
  - { source: sub, target: end }
  - { source: sub_start, target: A }
  - { source: A, target: sub_end }
"#;
        let model = ProcessModel::from_yaml_str(yaml).unwrap();
        assert_eq!(model, nested());
    }

    #[test]
    fn yaml_boundary_event_with_message() {
        let yaml = r#"
id: p
elements:
  - { id: start, type: START_EVENT }
  - { id: A, type: SERVICE_TASK, job_type: work }
  - id: cancel
    type: BOUNDARY_EVENT
    attached_to: A
    interrupting: false
    message: { name: cancel, correlation_key: { variable: orderId } }
flows:
  - { source: start, target: A }
"#;
        let model = ProcessModel::from_yaml_str(yaml).unwrap();
        let boundary = model.element("cancel").unwrap();
        assert!(!boundary.interrupting);
        assert_eq!(boundary.flow_scope.as_deref(), Some("p"));
        assert_eq!(
            boundary.event,
            Some(EventDefinition::Message {
                name: "cancel".into(),
                correlation_key: CorrelationKey::Variable("orderId".into()),
            })
        );
        assert_eq!(model.boundary_events("A").len(), 1);
    }

    #[test]
    fn condition_truthiness() {
        let c = Condition {
            variable: "ok".into(),
            equals: None,
        };
        assert!(c.holds(Some(&serde_json::json!(true))));
        assert!(!c.holds(Some(&serde_json::json!(0))));
        assert!(!c.holds(None));
        let eq = Condition {
            variable: "kind".into(),
            equals: Some(serde_json::json!("gold")),
        };
        assert!(eq.holds(Some(&serde_json::json!("gold"))));
        assert!(!eq.holds(Some(&serde_json::json!("silver"))));
    }
}
