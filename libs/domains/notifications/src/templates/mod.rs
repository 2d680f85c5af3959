//! Email template rendering engine.
//!
//! Handlebars templates for the daily report, the failure escalation notice
//! and the connectivity test message.

use crate::error::{DeliveryError, DeliveryResult};
use handlebars::Handlebars;
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

/// Rendered email content.
#[derive(Debug, Clone)]
pub struct RenderedEmail {
    /// HTML body content.
    pub html: String,
    /// Plain text body content.
    pub text: String,
    /// Email subject line.
    pub subject: String,
}

/// Data for the daily report email.
#[derive(Debug, Clone, Serialize)]
pub struct ReportEmailData {
    /// Report day, `YYYY-MM-DD`.
    pub date: String,
    pub period_start: String,
    pub period_end: String,
    /// Upper-case attachment format label.
    pub format: String,
    pub attachment_names: Vec<String>,
}

/// Data for the operations escalation notice.
#[derive(Debug, Clone, Serialize)]
pub struct EscalationData {
    /// Scheduled `HH:mm` of the failed run.
    pub scheduled_time: String,
    /// Business date of the failed run.
    pub run_date: String,
    pub error_code: String,
    pub error_message: String,
    /// One line per failed recipient.
    pub details: Vec<String>,
    /// `YYYY-MM-DD HH:MM:SS (UTC+8)`.
    pub occurred_at: String,
}

/// Data for the connectivity test email.
#[derive(Debug, Clone, Serialize)]
pub struct TestEmailData {
    pub provider: String,
    pub platform: String,
    pub sent_at: String,
}

/// Template engine for rendering email templates.
///
/// HTML templates are escaped; plain-text templates are rendered verbatim so
/// error messages reach the reader byte for byte.
pub struct TemplateEngine {
    html: Arc<Handlebars<'static>>,
    text: Arc<Handlebars<'static>>,
}

impl TemplateEngine {
    /// Create a new template engine with all templates registered.
    pub fn new() -> DeliveryResult<Self> {
        let mut html = Handlebars::new();
        register(
            &mut html,
            &[
                ("report", REPORT_HTML_TEMPLATE),
                ("escalation", ESCALATION_HTML_TEMPLATE),
                ("test", TEST_HTML_TEMPLATE),
            ],
        )?;

        let mut text = Handlebars::new();
        text.register_escape_fn(handlebars::no_escape);
        register(
            &mut text,
            &[
                ("report", REPORT_TEXT_TEMPLATE),
                ("escalation", ESCALATION_TEXT_TEMPLATE),
            ],
        )?;

        Ok(Self {
            html: Arc::new(html),
            text: Arc::new(text),
        })
    }

    fn render_html<T: Serialize>(&self, template_name: &str, data: &T) -> DeliveryResult<String> {
        Ok(self.html.render(template_name, data)?)
    }

    fn render_text<T: Serialize>(&self, template_name: &str, data: &T) -> DeliveryResult<String> {
        Ok(self.text.render(template_name, data)?)
    }

    /// Subject line of the daily report for `date` (`YYYY-MM-DD`).
    pub fn report_subject(date: &str) -> String {
        format!("員工打卡日報表 - {}", date)
    }

    /// Render the daily report email.
    pub fn render_report(&self, data: &ReportEmailData) -> DeliveryResult<RenderedEmail> {
        debug!(date = %data.date, format = %data.format, "Rendering report email");

        Ok(RenderedEmail {
            html: self.render_html("report", data)?,
            text: self.render_text("report", data)?,
            subject: Self::report_subject(&data.date),
        })
    }

    /// Render the escalation notice sent when a report run fails.
    pub fn render_escalation(&self, data: &EscalationData) -> DeliveryResult<RenderedEmail> {
        debug!(code = %data.error_code, "Rendering escalation email");

        Ok(RenderedEmail {
            html: self.render_html("escalation", data)?,
            text: self.render_text("escalation", data)?,
            subject: format!(
                "[打卡系統] 每日報表寄送失敗 - {} {}",
                data.scheduled_time, data.run_date
            ),
        })
    }

    /// Render a connectivity test message.
    pub fn render_test(&self, data: &TestEmailData) -> DeliveryResult<RenderedEmail> {
        Ok(RenderedEmail {
            html: self.render_html("test", data)?,
            text: format!("測試郵件：經由 {} 寄出於 {}", data.provider, data.sent_at),
            subject: "[打卡系統] 郵件服務測試".to_string(),
        })
    }
}

fn register(handlebars: &mut Handlebars<'static>, templates: &[(&str, &str)]) -> DeliveryResult<()> {
    for &(name, source) in templates {
        handlebars.register_template_string(name, source).map_err(|e| {
            DeliveryError::MessageBuild(format!("Failed to register {}: {}", name, e))
        })?;
    }
    Ok(())
}

// ============================================================================
// Email Templates
// ============================================================================

const REPORT_HTML_TEMPLATE: &str = r#"<!DOCTYPE html>
<html lang="zh-Hant">
<head>
  <meta charset="UTF-8">
  <title>員工打卡日報表</title>
</head>
<body style="margin: 0; padding: 0; font-family: -apple-system, 'Noto Sans TC', 'Microsoft JhengHei', sans-serif; background-color: #f4f4f5;">
  <table role="presentation" width="100%" cellspacing="0" cellpadding="0" style="max-width: 600px; margin: 0 auto; padding: 40px 20px;">
    <tr>
      <td style="background-color: #ffffff; border-radius: 8px; padding: 32px;">
        <h1 style="color: #18181b; font-size: 22px; margin: 0 0 16px 0;">員工打卡日報表</h1>
        <p style="color: #52525b; font-size: 15px; line-height: 24px; margin: 0 0 16px 0;">
          您好，附件為 {{date}} 的員工打卡紀錄。
        </p>
        <table width="100%" cellspacing="0" cellpadding="6" style="font-size: 14px; color: #3f3f46; border-top: 1px solid #e4e4e7;">
          <tr><td style="width: 120px;">統計期間</td><td>{{period_start}} ~ {{period_end}}</td></tr>
          <tr><td>報表格式</td><td>{{format}}</td></tr>
          <tr>
            <td>附件</td>
            <td>{{#each attachment_names}}{{this}}<br>{{/each}}</td>
          </tr>
        </table>
        <p style="color: #a1a1aa; font-size: 12px; margin: 24px 0 0 0;">此郵件由打卡系統自動寄出，請勿直接回覆。</p>
      </td>
    </tr>
  </table>
</body>
</html>"#;

const REPORT_TEXT_TEMPLATE: &str = r#"員工打卡日報表

附件為 {{date}} 的員工打卡紀錄。

統計期間：{{period_start}} ~ {{period_end}}
報表格式：{{format}}
附件：
{{#each attachment_names}}- {{this}}
{{/each}}
此郵件由打卡系統自動寄出，請勿直接回覆。
"#;

const ESCALATION_HTML_TEMPLATE: &str = r#"<!DOCTYPE html>
<html lang="zh-Hant">
<head>
  <meta charset="UTF-8">
  <title>每日報表寄送失敗</title>
</head>
<body style="margin: 0; padding: 0; font-family: -apple-system, 'Noto Sans TC', 'Microsoft JhengHei', sans-serif; background-color: #f4f4f5;">
  <table role="presentation" width="100%" cellspacing="0" cellpadding="0" style="max-width: 600px; margin: 0 auto; padding: 40px 20px;">
    <tr>
      <td style="background-color: #ffffff; border-radius: 8px; padding: 32px; border-left: 4px solid #dc2626;">
        <h1 style="color: #991b1b; font-size: 20px; margin: 0 0 16px 0;">每日報表寄送失敗</h1>
        <p style="color: #52525b; font-size: 15px; margin: 0 0 16px 0;">
          排定於 {{scheduled_time}} 的每日報表（{{run_date}}）未能完成寄送。
        </p>
        <table width="100%" cellspacing="0" cellpadding="6" style="font-size: 14px; color: #3f3f46;">
          <tr><td style="width: 120px;">錯誤代碼</td><td><code>{{error_code}}</code></td></tr>
          <tr><td>錯誤訊息</td><td>{{error_message}}</td></tr>
          <tr><td>發生時間</td><td>{{occurred_at}}</td></tr>
        </table>
        {{#if details}}
        <ul style="color: #3f3f46; font-size: 13px;">
          {{#each details}}<li>{{this}}</li>{{/each}}
        </ul>
        {{/if}}
        <p style="color: #71717a; font-size: 13px; margin: 24px 0 0 0;">請檢查郵件服務設定與網路連線。</p>
      </td>
    </tr>
  </table>
</body>
</html>"#;

const ESCALATION_TEXT_TEMPLATE: &str = r#"每日報表寄送失敗

排定時間：{{scheduled_time}}
報表日期：{{run_date}}
錯誤代碼：{{error_code}}
錯誤訊息：{{error_message}}
發生時間：{{occurred_at}}
{{#each details}}- {{this}}
{{/each}}
請檢查郵件服務設定與網路連線。
"#;

const TEST_HTML_TEMPLATE: &str = r#"<!DOCTYPE html>
<html lang="zh-Hant">
<head><meta charset="UTF-8"><title>郵件服務測試</title></head>
<body style="font-family: -apple-system, 'Noto Sans TC', sans-serif;">
  <p>這是一封測試郵件。</p>
  <p>服務商：{{provider}}<br>環境：{{platform}}<br>寄出時間：{{sent_at}}</p>
</body>
</html>"#;
