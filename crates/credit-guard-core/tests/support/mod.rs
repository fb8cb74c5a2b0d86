use std::sync::Arc;

use credit_guard_core::{
    AuditTrail, CompanyRecord, CompletionProvider, Orchestrator, PipelineConfig, RetryPolicy,
};

pub use credit_guard_core::test_support::{ScriptedProvider, SCRIPTED_TOKENS};

pub const SAFE_VERDICT: &str = r#"{"is_safe": true, "reason": "contenido empresarial legítimo", "confidence": 0.92}"#;
pub const UNSAFE_VERDICT: &str = r#"{"is_safe": false, "reason": "intento de manipulación del sistema", "confidence": 0.97}"#;

pub const FINANCIAL_REPLY: &str = r#"```json
{"solvencia": "Alta", "liquidez": "Adecuada", "rentabilidad": "Media", "tendencia_ventas": "Creciente",
 "resumen_ejecutivo": "Estructura de capital sana con pasivos moderados.", "puntaje_financiero": 0.8}
```"#;
pub const REPUTATIONAL_REPLY: &str = r#"{"sentimiento_general": "Positivo", "puntaje_sentimiento": 0.4,
 "temas_positivos": ["servicio"], "temas_negativos": ["demoras"], "resumen_ejecutivo": "Percepción mayormente favorable."}"#;
pub const BEHAVIORAL_REPLY: &str = r#"{"patron_de_pago": "Puntual", "fiabilidad_referencias": "Alta",
 "riesgo_comportamental": "Bajo", "resumen_ejecutivo": "Pagos a tiempo según proveedores."}"#;
pub const CONSOLIDATION_REPLY: &str = r#"{"credit_recommendation": "Aprobar", "justification": "Indicadores sólidos en todas las dimensiones.",
 "contributing_factors": ["solvencia alta", "pagos puntuales"]}"#;

/// Validator says safe, every analyzer and the consolidation call answer well.
pub fn healthy_provider() -> ScriptedProvider {
    ScriptedProvider::replying(SAFE_VERDICT)
        .reply_for_agent("financial_analyzer", FINANCIAL_REPLY)
        .reply_for_agent("reputational_analyzer", REPUTATIONAL_REPLY)
        .reply_for_agent("behavioral_analyzer", BEHAVIORAL_REPLY)
        .reply_for_agent("consolidation", CONSOLIDATION_REPLY)
}

pub fn test_config() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.gateway.retry = RetryPolicy::none();
    config
}

pub fn orchestrator(provider: &Arc<ScriptedProvider>) -> Orchestrator {
    Orchestrator::new(
        Arc::clone(provider) as Arc<dyn CompletionProvider>,
        &test_config(),
        Arc::new(AuditTrail::new()),
    )
    .expect("default configuration is valid")
}

pub fn sample_record() -> CompanyRecord {
    CompanyRecord {
        company_id: "PYME_001".into(),
        company_name: "Innovaciones Andinas S.A.".into(),
        financial_statements: "Activos: $100,000, Pasivos: $60,000".into(),
        social_media_data: "Clientes destacan la atención; algunas quejas por demoras en entregas.".into(),
        commercial_references: "Proveedor Textil Norte: cliente desde hace 4 años, sin incidentes.".into(),
        payment_history: "Últimos 12 pagos realizados a tiempo.".into(),
        ..Default::default()
    }
}
