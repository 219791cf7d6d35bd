/// Name of a runtime or driver status code, for log and error messages.
pub fn status_name(status: i32) -> &'static str {
    match status {
        0 => "ACL_SUCCESS",
        100_000 => "ACL_ERROR_INVALID_PARAM",
        100_001 => "ACL_ERROR_UNINITIALIZE",
        100_002 => "ACL_ERROR_REPEAT_INITIALIZE",
        100_024 => "ACL_ERROR_FEATURE_UNSUPPORTED",
        107_000 => "ACL_ERROR_RT_PARAM_INVALID",
        107_001 => "ACL_ERROR_RT_INVALID_DEVICEID",
        107_002 => "ACL_ERROR_RT_CONTEXT_NULL",
        107_003 => "ACL_ERROR_RT_STREAM_CONTEXT",
        207_000 => "ACL_ERROR_RT_FEATURE_NOT_SUPPORT",
        207_001 => "ACL_ERROR_RT_MEMORY_ALLOCATION",
        207_002 => "ACL_ERROR_RT_MEMORY_FREE",
        507_000 => "ACL_ERROR_RT_INTERNAL_ERROR",
        507_033 => "ACL_ERROR_RT_DEVICE_TASK_ABORT",
        507_899 => "ACL_ERROR_RT_DRV_INTERNAL_ERROR",
        _ => "ACL_ERROR_UNKNOWN",
    }
}
