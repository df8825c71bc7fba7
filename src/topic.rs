/// Segment-wise topic filter match: literal segments compare exactly and
/// `+` matches exactly one segment. `#` is not part of the server
/// contract and is rejected by never matching.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_segs = filter.split('/');
    let mut topic_segs = topic.split('/');
    loop {
        match (filter_segs.next(), topic_segs.next()) {
            (None, None) => return true,
            (Some(f), Some(t)) => {
                if f != "+" && f != t {
                    return false;
                }
            }
            _ => return false,
        }
    }
}

/// Extract the `idx`-th slash-separated segment of a topic.
pub fn segment(topic: &str, idx: usize) -> Option<&str> {
    topic.split('/').nth(idx)
}

/// Renders the platform's per-device topic family.
#[derive(Debug, Clone)]
pub struct TopicSpace {
    product_key: String,
    device_name: String,
}

impl TopicSpace {
    pub fn new(product_key: &str, device_name: &str) -> Self {
        Self {
            product_key: product_key.to_string(),
            device_name: device_name.to_string(),
        }
    }

    fn base(&self) -> String {
        format!("sys/{}/{}", self.product_key, self.device_name)
    }

    // Thing-model topics.

    pub fn property_post(&self) -> String {
        format!("{}/thingmodel/property/post", self.base())
    }

    pub fn property_post_reply(&self) -> String {
        format!("{}/thingmodel/property/post_reply", self.base())
    }

    pub fn property_set(&self) -> String {
        format!("{}/thingmodel/service/preset/propertySet/post", self.base())
    }

    pub fn property_set_reply(&self) -> String {
        format!("{}/thingmodel/service/preset/propertySet/post_reply", self.base())
    }

    pub fn event_post(&self, module: &str, identifier: &str) -> String {
        format!("{}/thingmodel/event/{}/{}/post", self.base(), module, identifier)
    }

    pub fn event_post_reply_filter(&self) -> String {
        format!("{}/thingmodel/event/+/+/post_reply", self.base())
    }

    pub fn service_call_filter(&self) -> String {
        format!("{}/thingmodel/service/+/+/+", self.base())
    }

    pub fn service_call_reply(&self, module: &str, identifier: &str, topic_uuid: &str) -> String {
        format!(
            "{}/thingmodel/service/{}/{}/{}_reply",
            self.base(),
            module,
            identifier,
            topic_uuid
        )
    }

    pub fn custom(&self, suffix: &str) -> String {
        format!("{}/custom/{}", self.base(), suffix)
    }

    pub fn device_delay_filter(&self) -> String {
        format!("{}/delay/+/post", self.base())
    }

    pub fn device_delay_reply(&self, uuid: &str) -> String {
        format!("{}/delay/{}/post_reply", self.base(), uuid)
    }

    pub fn shadow_post(&self) -> String {
        format!("{}/shadow/post", self.base())
    }

    pub fn shadow_get(&self) -> String {
        format!("{}/shadow/get", self.base())
    }

    pub fn shadow_clear(&self) -> String {
        format!("{}/shadow/clear", self.base())
    }

    pub fn shadow_get_reply(&self) -> String {
        format!("{}/shadow/get_reply", self.base())
    }

    pub fn shadow_set(&self) -> String {
        format!("{}/shadow/set", self.base())
    }

    pub fn webshell_command_filter(&self) -> String {
        format!("{}/webshell/command/+", self.base())
    }

    pub fn webshell_command_reply(&self, uid: &str) -> String {
        format!("{}/webshell/command_reply/{}", self.base(), uid)
    }

    pub fn webshell_pong(&self, uid: &str) -> String {
        format!("{}/webshell/pong/{}", self.base(), uid)
    }

    // OTA topics.

    pub fn ota_notify_filter(&self) -> String {
        format!("{}/ota/notify/+", self.base())
    }

    pub fn ota_upgrade_post(&self) -> String {
        format!("{}/ota/upgrade/post", self.base())
    }

    pub fn ota_upgrade_post_reply(&self) -> String {
        format!("{}/ota/upgrade/post_reply", self.base())
    }

    pub fn ota_progress(&self, job_id: &str) -> String {
        format!("{}/ota/progress/{}", self.base(), job_id)
    }

    pub fn ota_version(&self) -> String {
        format!("{}/ota/version", self.base())
    }

    // Log upload topics.

    pub fn log_batch_report(&self) -> String {
        format!("{}/log/batch/report", self.base())
    }

    pub fn log_batch_config(&self) -> String {
        format!("{}/log/batch/config", self.base())
    }
}
