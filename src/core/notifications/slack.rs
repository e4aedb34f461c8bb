use super::{JobEvent, NotificationChannel};
use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;

pub struct SlackNotifier {
    webhook_url: String,
    client: reqwest::Client,
}

impl SlackNotifier {
    pub fn new(webhook_url: String) -> Self {
        Self {
            webhook_url,
            client: reqwest::Client::new(),
        }
    }

    fn format_message(&self, event: &JobEvent) -> serde_json::Value {
        match event {
            JobEvent::DeviceBound {
                job_id,
                customer_id,
                device_name,
                mac_address,
            } => {
                let short_id = &job_id[..8.min(job_id.len())];
                json!({
                    "blocks": [
                        {
                            "type": "header",
                            "text": {
                                "type": "plain_text",
                                "text": "Device Bound",
                                "emoji": true
                            }
                        },
                        {
                            "type": "section",
                            "fields": [
                                {
                                    "type": "mrkdwn",
                                    "text": format!("*Device:*\n{}", device_name)
                                },
                                {
                                    "type": "mrkdwn",
                                    "text": format!("*Customer:*\n{}", customer_id)
                                },
                                {
                                    "type": "mrkdwn",
                                    "text": format!("*MAC:*\n`{}`", mac_address)
                                },
                                {
                                    "type": "mrkdwn",
                                    "text": format!("*Job ID:*\n`{}`", short_id)
                                }
                            ]
                        }
                    ]
                })
            }
            JobEvent::Completed {
                job_id,
                customer_id,
                device_name,
                duration_secs,
            } => {
                let short_id = &job_id[..8.min(job_id.len())];
                json!({
                    "blocks": [
                        {
                            "type": "header",
                            "text": {
                                "type": "plain_text",
                                "text": "Provisioning Complete",
                                "emoji": true
                            }
                        },
                        {
                            "type": "section",
                            "fields": [
                                {
                                    "type": "mrkdwn",
                                    "text": format!("*Device:*\n{}", device_name)
                                },
                                {
                                    "type": "mrkdwn",
                                    "text": format!("*Customer:*\n{}", customer_id)
                                },
                                {
                                    "type": "mrkdwn",
                                    "text": format!("*Job ID:*\n`{}`", short_id)
                                },
                                {
                                    "type": "mrkdwn",
                                    "text": format!("*Duration:*\n{}m {}s", duration_secs / 60, duration_secs % 60)
                                }
                            ]
                        }
                    ]
                })
            }
            JobEvent::Ended {
                job_id,
                customer_id,
                device_name,
                status,
                reason,
            } => {
                let short_id = &job_id[..8.min(job_id.len())];
                let header = if status == "CANCELLED" {
                    "Provisioning Cancelled"
                } else {
                    "Provisioning Failed"
                };
                json!({
                    "blocks": [
                        {
                            "type": "header",
                            "text": {
                                "type": "plain_text",
                                "text": header,
                                "emoji": true
                            }
                        },
                        {
                            "type": "section",
                            "fields": [
                                {
                                    "type": "mrkdwn",
                                    "text": format!("*Device:*\n{}", device_name.as_deref().unwrap_or("(not bound)"))
                                },
                                {
                                    "type": "mrkdwn",
                                    "text": format!("*Customer:*\n{}", customer_id)
                                },
                                {
                                    "type": "mrkdwn",
                                    "text": format!("*Job ID:*\n`{}`", short_id)
                                }
                            ]
                        },
                        {
                            "type": "section",
                            "text": {
                                "type": "mrkdwn",
                                "text": format!("*Reason:*\n```{}```", reason.as_deref().unwrap_or("cancelled by operator"))
                            }
                        }
                    ]
                })
            }
        }
    }
}

#[async_trait]
impl NotificationChannel for SlackNotifier {
    async fn notify(&self, event: JobEvent) -> Result<()> {
        let payload = self.format_message(&event);
        self.client
            .post(&self.webhook_url)
            .json(&payload)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_message_carries_reason() {
        let notifier = SlackNotifier::new("http://localhost".into());
        let payload = notifier.format_message(&JobEvent::Ended {
            job_id: "0192f3a4-aaaa".into(),
            customer_id: "exc".into(),
            device_name: Some("EXC-NB-001".into()),
            status: "FAILED".into(),
            reason: Some("install script failed: disk not found".into()),
        });
        let text = payload.to_string();
        assert!(text.contains("Provisioning Failed"));
        assert!(text.contains("disk not found"));
        assert!(text.contains("0192f3a4"));
    }
}
