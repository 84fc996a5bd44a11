//! Directive processor behavior: conditionals, loops, switch, includes,
//! file I/O, arrays, and dictionaries.

use pretty_assertions::assert_eq;
use scenic::{CollectMessages, ErrorKind, MemoryStreams, ParseError, ParserOptions, parse_scene};

fn parse_with_env(env: &mut MemoryStreams, source: &str) -> (scenic::SceneData, CollectMessages) {
    let mut messages = CollectMessages::new();
    let scene = parse_scene("test.pov", source, env, &mut messages, ParserOptions::default())
        .unwrap_or_else(|e| panic!("scene failed to parse: {e}"));
    (scene, messages)
}

fn debug_output(source: &str) -> String {
    let mut env = MemoryStreams::new();
    let (_, messages) = parse_with_env(&mut env, source);
    messages.debug_output().to_owned()
}

fn parse_err(source: &str) -> ParseError {
    let mut env = MemoryStreams::new();
    let mut messages = CollectMessages::new();
    parse_scene("test.pov", source, &mut env, &mut messages, ParserOptions::default())
        .err()
        .expect("scene should fail to parse")
}

#[test]
fn test_if_else_branches() {
    let out = debug_output(
        "#if (1 < 2) #debug \"then\" #else #debug \"else\" #end\n\
         #if (1 > 2) #debug \"then\" #else #debug \"else\" #end\n\
         #if (0) #debug \"dead\" #end",
    );
    assert_eq!(out, "then\nelse\n");
}

#[test]
fn test_nested_conditionals_skip_correctly() {
    let out = debug_output(
        "#if (0)\n\
           #if (1) #debug \"inner dead\" #end\n\
           #while (1) #debug \"never\" #end\n\
         #else\n\
           #debug \"alive\"\n\
         #end",
    );
    assert_eq!(out, "alive\n");
}

#[test]
fn test_ifdef_and_ifndef() {
    let out = debug_output(
        "#declare known = 1;\n\
         #ifdef (known) #debug \"has\" #end\n\
         #ifndef (unknown) #debug \"lacks\" #end",
    );
    assert_eq!(out, "has\nlacks\n");
}

#[test]
fn test_while_loop() {
    let out = debug_output(
        "#declare i = 0;\n\
         #declare total = 0;\n\
         #while (i < 4)\n\
           #declare total = total + i;\n\
           #declare i = i + 1;\n\
         #end\n\
         #debug str(total, 0, -1)",
    );
    assert_eq!(out, "6.0\n");
}

#[test]
fn test_for_with_negative_step() {
    let out = debug_output(
        "#declare acc = 0;\n\
         #for(i, 5, 1, -2)\n\
           #declare acc = acc * 10 + i;\n\
         #end\n\
         #debug str(acc, 0, -1)",
    );
    // iterations: 5, 3, 1
    assert_eq!(out, "531.0\n");
}

#[test]
fn test_for_zero_step_rejected() {
    let err = parse_err("#for(i, 0, 5, 0) #end");
    assert_eq!(err.kind, ErrorKind::Domain);
}

#[test]
fn test_switch_case_fallthrough_and_break() {
    let out = debug_output(
        "#declare v = 2;\n\
         #switch (v)\n\
           #case (1)\n\
             #debug \"one\"\n\
           #break\n\
           #case (2)\n\
             #debug \"two\"\n\
           #case (3)\n\
             #debug \"fell through\"\n\
           #break\n\
           #case (4)\n\
             #debug \"four\"\n\
         #end",
    );
    assert_eq!(out, "two\nfell through\n");
}

#[test]
fn test_switch_range_and_else() {
    let out = debug_output(
        "#switch (7)\n\
           #range (1, 5) #debug \"low\" #break\n\
           #range (6, 10) #debug \"mid\" #break\n\
         #end\n\
         #switch (99)\n\
           #case (1) #debug \"one\" #break\n\
           #else #debug \"default\"\n\
         #end",
    );
    assert_eq!(out, "mid\ndefault\n");
}

#[test]
fn test_include_expansion() {
    let mut env = MemoryStreams::new();
    env.insert("colors.inc", "#declare Red = rgb <1, 0, 0>;\n");
    let (_, messages) = parse_with_env(
        &mut env,
        "#include \"colors.inc\"\n#debug str(Red.red, 0, -1)",
    );
    assert_eq!(messages.debug_output(), "1.0\n");
}

#[test]
fn test_missing_include_is_io_error() {
    let err = parse_err("#include \"nowhere.inc\"");
    assert_eq!(err.kind, ErrorKind::Io);
}

#[test]
fn test_macro_defined_in_include_expands_in_main() {
    let mut env = MemoryStreams::new();
    env.insert("lib.inc", "#macro twice(n) (n * 2) #end\n");
    let (_, messages) = parse_with_env(
        &mut env,
        "#include \"lib.inc\"\n#declare r = twice(21);\n#debug str(r, 0, -1)",
    );
    assert_eq!(messages.debug_output(), "42.0\n");
}

#[test]
fn test_fopen_write_then_read_back() {
    let mut env = MemoryStreams::new();
    let (_, messages) = parse_with_env(
        &mut env,
        "#fopen Out \"data.txt\" write\n\
         #write (Out, 1.5, \", \", <1, 2, 3>, \", \", 42)\n\
         #fclose Out\n\
         #fopen In \"data.txt\" read\n\
         #read (In, A, V, B)\n\
         #debug str(A, 0, -1)\n\
         #debug str(V.y, 0, -1)\n\
         #debug str(B, 0, -1)",
    );
    assert_eq!(messages.debug_output(), "1.5\n2.0\n42.0\n");
    assert_eq!(env.get("data.txt"), Some("1.5, <1.0,2.0,3.0>, 42.0"));
}

#[test]
fn test_read_past_end_yields_undefined() {
    let mut env = MemoryStreams::new();
    env.insert("short.txt", "7");
    let (_, messages) = parse_with_env(
        &mut env,
        "#fopen In \"short.txt\" read\n\
         #read (In, A, B)\n\
         #debug str(A, 0, -1)\n\
         #if (defined(B)) #debug \"B set\" #else #debug \"B undefined\" #end",
    );
    assert_eq!(messages.debug_output(), "7.0\nB undefined\n");
}

#[test]
fn test_array_declare_assign_and_grow() {
    let out = debug_output(
        "#declare a = array[3];\n\
         #declare a[0] = 10;\n\
         #declare a[2] = 30;\n\
         #debug str(a[0] + a[2], 0, -1)\n\
         #debug str(dimension_size(a, 1), 0, -1)\n\
         #declare a[5] = 60;\n\
         #debug str(dimension_size(a, 1), 0, -1)",
    );
    assert_eq!(out, "40.0\n3.0\n6.0\n");
}

#[test]
fn test_array_initializer_and_dimensions() {
    let out = debug_output(
        "#declare a = array[2][2] { 1, 2, 3, 4 };\n\
         #debug str(dimensions(a), 0, -1)\n\
         #debug str(a[1][0], 0, -1)",
    );
    assert_eq!(out, "2.0\n3.0\n");
}

#[test]
fn test_unassigned_array_element_is_symbol_error() {
    let err = parse_err("#declare a = array[2];\n#declare x = a[0];");
    assert_eq!(err.kind, ErrorKind::Symbol);
}

#[test]
fn test_mixed_array_type_rule() {
    let err = parse_err("#declare a = array[2];\n#declare a[0] = 1;\n#declare a[1] = \"text\";");
    assert_eq!(err.kind, ErrorKind::Type);

    let out = debug_output(
        "#declare a = array mixed [2];\n\
         #declare a[0] = 1;\n\
         #declare a[1] = \"text\";\n\
         #debug a[1]",
    );
    assert_eq!(out, "text\n");
}

#[test]
fn test_dictionary_entries() {
    let out = debug_output(
        "#declare d = dictionary { [\"radius\"] 2.5, [\"name\"] \"ball\" };\n\
         #declare d.extra = 7;\n\
         #debug str(d.radius, 0, -1)\n\
         #debug d.name\n\
         #debug str(d.extra, 0, -1)\n\
         #if (defined(d.missing)) #debug \"found\" #else #debug \"missing\" #end",
    );
    assert_eq!(out, "2.5\nball\n7.0\nmissing\n");
}

#[test]
fn test_version_directive_and_legacy_comments() {
    // nested block comments only parse below language version 3.5
    let out = debug_output("#version 3.1;\n/* outer /* inner */ still outer */\n#debug \"ok\"");
    assert_eq!(out, "ok\n");

    let err = parse_err("#version 3.7;\n/* outer /* inner */ tail */\n#debug \"ok\"");
    assert_eq!(err.kind, ErrorKind::Parse);
}

#[test]
fn test_charset_deprecation_warning() {
    let mut env = MemoryStreams::new();
    let (_, messages) = parse_with_env(
        &mut env,
        "global_settings { assumed_gamma 1 charset utf8 }\nsphere { <0,0,0>, 1 }",
    );
    assert!(messages.contains("charset"));
    assert!(messages.contains("deprecated"));
}

#[test]
fn test_warning_directive_counts() {
    let mut env = MemoryStreams::new();
    let (_, messages) = parse_with_env(&mut env, "#warning \"check your units\"");
    assert!(messages.contains("check your units"));
}

#[test]
fn test_end_without_opener_is_error() {
    let err = parse_err("#end");
    assert_eq!(err.kind, ErrorKind::Parse);
}

#[test]
fn test_unclosed_conditional_is_error() {
    let err = parse_err("#if (1) #debug \"x\"");
    assert!(err.message.contains("#end") || err.message.contains("open conditional"));
}

#[test]
fn test_declared_transform_value() {
    let out = debug_output(
        "#declare Move = transform { translate <1, 2, 3> };\n\
         #declare Combined = transform { transform Move scale 2 };\n\
         #debug \"declared\"",
    );
    assert_eq!(out, "declared\n");
}

#[test]
fn test_macro_body_replay_across_include() {
    // a macro declared in an include is still replayable after the include
    // stream has been popped, via the recorded (stream, offset) pair
    let mut env = MemoryStreams::new();
    env.insert("m.inc", "#macro hello() #debug \"from include\" #end\n");
    let (_, messages) = parse_with_env(&mut env, "#include \"m.inc\"\nhello()\nhello()");
    assert_eq!(messages.debug_output(), "from include\nfrom include\n");
}

#[test]
fn test_local_at_file_scope_behaves_like_declare() {
    let out = debug_output("#local v = 3;\n#debug str(v, 0, -1)");
    assert_eq!(out, "3.0\n");
}
