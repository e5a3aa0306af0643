pub mod dose_response;
pub mod heatmap_order;
pub mod relative_expression;
pub mod resolvable_steps;
