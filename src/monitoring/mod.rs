/*!
 * Monitoring
 * Tracing setup and operation spans
 */

mod tracer;

pub use tracer::{
    init_tracing, span_operation, OperationSpan, TraceFormat, SLOW_OPERATION_THRESHOLD,
};
